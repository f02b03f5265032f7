//! Per-session configuration snapshot.
//!
//! Captured once at session start; never mutated at runtime. Validation
//! happens up front so configuration bugs fail the start call instead of
//! degrading mid-debate.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::gateway::RetryProfile;
use crate::state::DebatePhase;
use crate::supervisor::SupervisorMode;
use crate::tools::ToolKind;

/// Error type for configuration validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("max_rounds must be in 1..=8, got {0}")]
    InvalidMaxRounds(u32),

    #[error("concurrency_limit must be in 1..=16, got {0}")]
    InvalidConcurrencyLimit(usize),

    #[error("evidence_source_kind_minimum must be ≥ 1, got {0}")]
    InvalidEvidenceMinimum(usize),

    #[error("per-phase timeout for {0} must be > 0")]
    InvalidPhaseTimeout(DebatePhase),
}

/// Conclusion phrases the report guard rejects, case-insensitively.
fn default_blocked_phrases() -> Vec<String> {
    [
        "insufficient information",
        "needs further analysis",
        "further analysis",
        "unknown",
        "需要进一步分析",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Session configuration. All fields have sensible defaults; construct with
/// `DebateConfig::default()` and override what the caller needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateConfig {
    /// Upper bound on critique/rebuttal loops (1..=8).
    pub max_rounds: u32,
    /// Max parallel specialists inside one fan-out (1..=16).
    pub concurrency_limit: usize,
    /// Per-phase wall-clock budget in milliseconds; doubles as the default
    /// command deadline for agents dispatched in that phase.
    pub per_phase_timeout_ms: BTreeMap<DebatePhase, u64>,
    /// Per-phase LLM retry behavior.
    pub retry_profiles: BTreeMap<DebatePhase, RetryProfile>,
    /// Which supervisor decider stack runs.
    pub supervisor_mode: SupervisorMode,
    /// Per-tool enablement snapshot.
    pub tools_enabled: BTreeMap<ToolKind, bool>,
    /// Phrases the report guard rejects as conclusions.
    pub blocked_conclusion_phrases: Vec<String>,
    /// Minimum distinct evidence source kinds in a final result.
    pub evidence_source_kind_minimum: usize,
    /// Specialist confidence below this triggers a critique round.
    pub confidence_threshold_low: f64,
    /// Judge confidence at or above this ends the debate early.
    pub consensus_threshold: f64,
    /// Approximate prompt token budget per agent call.
    pub max_prompt_tokens: usize,
    /// Model serving the supervisor decider.
    pub supervisor_model: String,
}

impl Default for DebateConfig {
    fn default() -> Self {
        let phases = [
            (DebatePhase::AssetMapping, 30_000),
            (DebatePhase::Analysis, 60_000),
            (DebatePhase::Critique, 60_000),
            (DebatePhase::Rebuttal, 60_000),
            (DebatePhase::Judgment, 180_000),
            (DebatePhase::Verification, 180_000),
            (DebatePhase::Report, 30_000),
        ];
        let retry = [
            (DebatePhase::Analysis, RetryProfile::analysis()),
            (DebatePhase::Critique, RetryProfile::analysis()),
            (DebatePhase::Rebuttal, RetryProfile::analysis()),
            (DebatePhase::Judgment, RetryProfile::adjudication()),
            (DebatePhase::Verification, RetryProfile::adjudication()),
        ];
        Self {
            max_rounds: 3,
            concurrency_limit: 4,
            per_phase_timeout_ms: phases.into_iter().collect(),
            retry_profiles: retry.into_iter().collect(),
            supervisor_mode: SupervisorMode::Hybrid,
            tools_enabled: ToolKind::all().iter().map(|kind| (*kind, true)).collect(),
            blocked_conclusion_phrases: default_blocked_phrases(),
            evidence_source_kind_minimum: 2,
            confidence_threshold_low: 0.4,
            consensus_threshold: 0.75,
            max_prompt_tokens: 6_000,
            supervisor_model: "supervisor-default".to_string(),
        }
    }
}

impl DebateConfig {
    /// Validate bounds. Configuration errors are fatal and surfaced before
    /// any node executes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=8).contains(&self.max_rounds) {
            return Err(ConfigError::InvalidMaxRounds(self.max_rounds));
        }
        if !(1..=16).contains(&self.concurrency_limit) {
            return Err(ConfigError::InvalidConcurrencyLimit(self.concurrency_limit));
        }
        if self.evidence_source_kind_minimum == 0 {
            return Err(ConfigError::InvalidEvidenceMinimum(
                self.evidence_source_kind_minimum,
            ));
        }
        for (phase, timeout) in &self.per_phase_timeout_ms {
            if *timeout == 0 {
                return Err(ConfigError::InvalidPhaseTimeout(*phase));
            }
        }
        Ok(())
    }

    /// Phase budget in milliseconds, with a conservative fallback.
    pub fn phase_timeout_ms(&self, phase: DebatePhase) -> u64 {
        self.per_phase_timeout_ms.get(&phase).copied().unwrap_or(60_000)
    }

    /// Retry profile for a phase, defaulting to the analysis profile.
    pub fn retry_profile(&self, phase: DebatePhase) -> RetryProfile {
        self.retry_profiles
            .get(&phase)
            .cloned()
            .unwrap_or_else(RetryProfile::analysis)
    }

    /// Whether a tool is enabled in this session.
    pub fn tool_enabled(&self, kind: ToolKind) -> bool {
        self.tools_enabled.get(&kind).copied().unwrap_or(false)
    }
}
