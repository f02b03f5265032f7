//! Capability-gated tool layer.
//!
//! Tool I/O implementations live outside this crate behind the [`Tool`]
//! trait; the core owns the fixed tool enumeration, the result/audit
//! schema, and the three-stage capability gate in [`ToolContextService`].

mod context;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use context::{ToolContext, ToolContextSection, ToolContextService};

/// The fixed enumeration of tools the debate can consult.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// Reads excerpts from incident-local log files.
    LocalLogReader,
    /// Looks up business/domain reference tables.
    DomainTableLookup,
    /// Searches the service's source repository.
    SourceRepoSearch,
    /// Scans the deploy/change window around the incident.
    ChangeWindowScanner,
    /// Pulls a metrics snapshot for the affected service.
    MetricsSnapshotAnalyzer,
    /// Retrieves similar historical cases from the runbook library.
    RunbookCaseLibrary,
}

impl ToolKind {
    /// All tool kinds, in stable order.
    pub fn all() -> [ToolKind; 6] {
        [
            Self::LocalLogReader,
            Self::DomainTableLookup,
            Self::SourceRepoSearch,
            Self::ChangeWindowScanner,
            Self::MetricsSnapshotAnalyzer,
            Self::RunbookCaseLibrary,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LocalLogReader => "local_log_reader",
            Self::DomainTableLookup => "domain_table_lookup",
            Self::SourceRepoSearch => "source_repo_search",
            Self::ChangeWindowScanner => "change_window_scanner",
            Self::MetricsSnapshotAnalyzer => "metrics_snapshot_analyzer",
            Self::RunbookCaseLibrary => "runbook_case_library",
        }
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of one tool invocation (or gate decision).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    /// Invocation succeeded.
    Ok,
    /// Tool disabled in session configuration.
    Disabled,
    /// Tool failed its availability probe.
    Unavailable,
    /// Skipped by policy (role not allow-listed, not targeted).
    Skipped,
    /// Skipped because the command forbade tool use.
    SkippedByCommand,
    /// Invocation raised an error.
    Error,
}

impl std::fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::Disabled => "disabled",
            Self::Unavailable => "unavailable",
            Self::Skipped => "skipped",
            Self::SkippedByCommand => "skipped_by_command",
            Self::Error => "error",
        };
        write!(f, "{name}")
    }
}

/// One audited action in a tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// When the action happened.
    pub timestamp: DateTime<Utc>,
    /// What was attempted (e.g. "invoke", "gate_check").
    pub action: String,
    /// Outcome status.
    pub status: ToolStatus,
    /// Parameters with secrets masked.
    pub parameters_redacted: serde_json::Map<String, serde_json::Value>,
    /// One-line outcome description.
    pub outcome_summary: String,
}

/// Result of one tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Invocation status.
    pub status: ToolStatus,
    /// One-paragraph summary for prompt injection.
    pub summary: String,
    /// Size-bounded preview for events and UI.
    pub data_preview: serde_json::Map<String, serde_json::Value>,
    /// Full payload for downstream processing.
    pub data_full: serde_json::Map<String, serde_json::Value>,
    /// Audit trail of this invocation.
    pub audit: Vec<AuditRecord>,
}

impl ToolResult {
    /// A result for a gate rejection or unavailable tool: no data, one
    /// explanatory summary.
    pub fn empty(status: ToolStatus, summary: &str) -> Self {
        Self {
            status,
            summary: summary.to_string(),
            data_preview: serde_json::Map::new(),
            data_full: serde_json::Map::new(),
            audit: Vec::new(),
        }
    }
}

/// Error type for the tool layer.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// A gate stage rejected the invocation.
    #[error("tool capability denied for {agent} on {tool}: {stage}")]
    CapabilityDenied {
        agent: String,
        tool: ToolKind,
        stage: String,
    },

    /// The tool implementation raised an error.
    #[error("tool {tool} invocation failed: {message}")]
    InvocationFailed { tool: ToolKind, message: String },

    /// No implementation registered for the tool.
    #[error("tool {0} not registered")]
    NotRegistered(ToolKind),
}

/// A tool collaborator. Availability is probed at startup.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Which enumerated tool this implements.
    fn kind(&self) -> ToolKind;

    /// Invoke with free-form parameters.
    async fn invoke(&self, params: &serde_json::Value) -> Result<ToolResult, ToolError>;

    /// Availability probe; defaults to available.
    async fn probe(&self) -> bool {
        true
    }
}

/// Registry of tool implementations with probed availability.
pub struct ToolRegistry {
    tools: BTreeMap<ToolKind, Arc<dyn Tool>>,
    availability: BTreeMap<ToolKind, bool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
            availability: BTreeMap::new(),
        }
    }

    /// Register an implementation. Availability defaults to true until
    /// [`probe_all`](Self::probe_all) runs.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> &mut Self {
        self.availability.insert(tool.kind(), true);
        self.tools.insert(tool.kind(), tool);
        self
    }

    /// Probe every registered tool and record availability.
    pub async fn probe_all(&mut self) {
        let mut availability = BTreeMap::new();
        for (kind, tool) in &self.tools {
            availability.insert(*kind, tool.probe().await);
        }
        self.availability = availability;
    }

    /// Whether a tool is registered and passed its probe.
    pub fn is_available(&self, kind: ToolKind) -> bool {
        self.tools.contains_key(&kind) && self.availability.get(&kind).copied().unwrap_or(false)
    }

    /// Look up an implementation.
    pub fn get(&self, kind: ToolKind) -> Option<Arc<dyn Tool>> {
        self.tools.get(&kind).cloned()
    }

    /// Registered kinds, in stable order.
    pub fn kinds(&self) -> Vec<ToolKind> {
        self.tools.keys().copied().collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeTool {
        kind: ToolKind,
        available: bool,
    }

    #[async_trait]
    impl Tool for FakeTool {
        fn kind(&self) -> ToolKind {
            self.kind
        }

        async fn invoke(&self, _params: &serde_json::Value) -> Result<ToolResult, ToolError> {
            Ok(ToolResult::empty(ToolStatus::Ok, "done"))
        }

        async fn probe(&self) -> bool {
            self.available
        }
    }

    #[tokio::test]
    async fn test_registry_probe() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FakeTool {
            kind: ToolKind::LocalLogReader,
            available: true,
        }));
        registry.register(Arc::new(FakeTool {
            kind: ToolKind::SourceRepoSearch,
            available: false,
        }));

        registry.probe_all().await;
        assert!(registry.is_available(ToolKind::LocalLogReader));
        assert!(!registry.is_available(ToolKind::SourceRepoSearch));
        assert!(!registry.is_available(ToolKind::DomainTableLookup));
    }

    #[test]
    fn test_tool_kind_wire_names() {
        assert_eq!(ToolKind::LocalLogReader.to_string(), "local_log_reader");
        assert_eq!(
            serde_json::to_string(&ToolKind::MetricsSnapshotAnalyzer).unwrap(),
            "\"metrics_snapshot_analyzer\""
        );
        assert_eq!(ToolKind::all().len(), 6);
    }

    #[test]
    fn test_tool_status_display() {
        assert_eq!(ToolStatus::SkippedByCommand.to_string(), "skipped_by_command");
    }
}
