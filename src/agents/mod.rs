//! Agent descriptors and the debate roster.
//!
//! Heterogeneous agents are tagged-variant descriptors registered in a
//! registry; the [`AgentRunner`] is a single polymorphic function over the
//! descriptor. No agent holds a mutable handle to another; all
//! communication flows through the shared state's command/feedback
//! mailboxes.

mod parser;
mod prompts;
mod runner;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub use parser::{
    extract_confidence_hint, parse_judge_payload, parse_structured_output, ParsedOutput,
};
pub use prompts::{
    schema_instruction, supervisor_prompt, supervisor_prompt_messages, system_prompt,
};
pub use runner::{AgentRunner, RunnerError};

use crate::gateway::RetryProfile;
use crate::state::{DebatePhase, SourceKind};
use crate::tools::ToolKind;

/// Coarse role classification for a debate agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// Evidence-gathering analyst (log, code, domain, metrics, change, runbook).
    Specialist,
    /// Challenges specialist claims.
    Critic,
    /// Responds to challenges.
    Rebuttal,
    /// Adjudicates the debate.
    Judge,
    /// Checks the adjudication.
    Verification,
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Specialist => "specialist",
            Self::Critic => "critic",
            Self::Rebuttal => "rebuttal",
            Self::Judge => "judge",
            Self::Verification => "verification",
        };
        write!(f, "{name}")
    }
}

/// Immutable description of one agent: everything the runner needs to
/// execute a command against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Unique agent name (e.g. "LogAgent").
    pub name: String,
    /// Role classification.
    pub role: AgentRole,
    /// Model serving this agent.
    pub model_id: String,
    /// Home phase the agent is normally dispatched in.
    pub phase: DebatePhase,
    /// Tools this agent may use (intersected with the command's targets and
    /// the tool allow-lists).
    pub allowed_tools: BTreeSet<ToolKind>,
    /// Structured output schema the agent is asked for.
    pub output_schema_id: String,
    /// Default evidence source kind for claims without an explicit kind.
    pub default_source_kind: SourceKind,
    /// LLM retry behavior for this agent.
    pub retry: RetryProfile,
}

/// The debate roster. Built once at session start from defaults (or caller
/// overrides) and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    agents: BTreeMap<String, AgentDescriptor>,
}

impl AgentRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            agents: BTreeMap::new(),
        }
    }

    /// The standard roster: six analysis specialists, critic, rebuttal,
    /// judge, and verification.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        let specialist = |name: &str, tools: &[ToolKind], kind: SourceKind| AgentDescriptor {
            name: name.to_string(),
            role: AgentRole::Specialist,
            model_id: "specialist-small".to_string(),
            phase: DebatePhase::Analysis,
            allowed_tools: tools.iter().copied().collect(),
            output_schema_id: "specialist_v1".to_string(),
            default_source_kind: kind,
            retry: RetryProfile::analysis(),
        };
        registry.register(specialist(
            "LogAgent",
            &[ToolKind::LocalLogReader],
            SourceKind::Log,
        ));
        registry.register(specialist(
            "CodeAgent",
            &[ToolKind::SourceRepoSearch],
            SourceKind::Code,
        ));
        registry.register(specialist(
            "DomainAgent",
            &[ToolKind::DomainTableLookup],
            SourceKind::Domain,
        ));
        registry.register(specialist(
            "MetricsAgent",
            &[ToolKind::MetricsSnapshotAnalyzer],
            SourceKind::Metric,
        ));
        registry.register(specialist(
            "ChangeAgent",
            &[ToolKind::ChangeWindowScanner, ToolKind::SourceRepoSearch],
            SourceKind::Change,
        ));
        registry.register(specialist(
            "RunbookAgent",
            &[ToolKind::RunbookCaseLibrary],
            SourceKind::Runbook,
        ));
        registry.register(AgentDescriptor {
            name: "CriticAgent".to_string(),
            role: AgentRole::Critic,
            model_id: "specialist-small".to_string(),
            phase: DebatePhase::Critique,
            allowed_tools: [ToolKind::RunbookCaseLibrary].into_iter().collect(),
            output_schema_id: "critic_v1".to_string(),
            default_source_kind: SourceKind::Trace,
            retry: RetryProfile::analysis(),
        });
        registry.register(AgentDescriptor {
            name: "RebuttalAgent".to_string(),
            role: AgentRole::Rebuttal,
            model_id: "specialist-small".to_string(),
            phase: DebatePhase::Rebuttal,
            allowed_tools: BTreeSet::new(),
            output_schema_id: "specialist_v1".to_string(),
            default_source_kind: SourceKind::Trace,
            retry: RetryProfile::analysis(),
        });
        registry.register(AgentDescriptor {
            name: "JudgeAgent".to_string(),
            role: AgentRole::Judge,
            model_id: "judge-large".to_string(),
            phase: DebatePhase::Judgment,
            allowed_tools: [ToolKind::RunbookCaseLibrary].into_iter().collect(),
            output_schema_id: "judge_v1".to_string(),
            default_source_kind: SourceKind::Trace,
            retry: RetryProfile::adjudication(),
        });
        registry.register(AgentDescriptor {
            name: "VerificationAgent".to_string(),
            role: AgentRole::Verification,
            model_id: "judge-large".to_string(),
            phase: DebatePhase::Verification,
            allowed_tools: BTreeSet::new(),
            output_schema_id: "verification_v1".to_string(),
            default_source_kind: SourceKind::Trace,
            retry: RetryProfile::adjudication(),
        });
        registry
    }

    /// Register (or replace) a descriptor.
    pub fn register(&mut self, descriptor: AgentDescriptor) {
        self.agents.insert(descriptor.name.clone(), descriptor);
    }

    /// Look up a descriptor by name.
    pub fn get(&self, name: &str) -> Option<&AgentDescriptor> {
        self.agents.get(name)
    }

    /// All agent names, in stable order.
    pub fn names(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    /// Names of analysis-phase specialists, in stable order. These are the
    /// agents fanned out after asset mapping.
    pub fn analysis_specialists(&self) -> Vec<String> {
        self.agents
            .values()
            .filter(|d| d.role == AgentRole::Specialist)
            .map(|d| d.name.clone())
            .collect()
    }

    /// Whether a name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_roster() {
        let registry = AgentRegistry::standard();
        assert_eq!(registry.names().len(), 10);
        assert!(registry.contains("LogAgent"));
        assert!(registry.contains("JudgeAgent"));
        assert!(!registry.contains("GhostAgent"));

        let specialists = registry.analysis_specialists();
        assert_eq!(specialists.len(), 6);
        assert!(specialists.contains(&"MetricsAgent".to_string()));
        assert!(!specialists.contains(&"CriticAgent".to_string()));
    }

    #[test]
    fn test_judge_uses_long_profile() {
        let registry = AgentRegistry::standard();
        let judge = registry.get("JudgeAgent").unwrap();
        assert_eq!(judge.retry.timeout_ms, 180_000);
        assert_eq!(judge.retry.max_retries, 1);
        assert_eq!(judge.model_id, "judge-large");
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = AgentRegistry::standard();
        let mut log_agent = registry.get("LogAgent").unwrap().clone();
        log_agent.model_id = "custom".to_string();
        registry.register(log_agent);
        assert_eq!(registry.get("LogAgent").unwrap().model_id, "custom");
        assert_eq!(registry.names().len(), 10);
    }
}
