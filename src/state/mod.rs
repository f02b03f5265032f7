//! Typed debate state, reducers, and the delta merge protocol.

mod reducer;
mod types;

pub use reducer::{StateDelta, StateError};
pub use types::{
    canonicalize_source_ref, AgentCommand, AgentFeedback, DebateMessage, DebateMetrics,
    DebatePhase, DebateState, Evidence, EvidenceStrength, FeedbackStatus, FinalResult, Incident,
    IncidentSeverity, MessageRole, RiskLevel, RouteState, SessionStatus, SourceKind, ToolUse,
};

/// Context keys used in `DebateState::context`.
pub mod context_keys {
    /// Condensed incident description fed to every prompt.
    pub const INCIDENT_SUMMARY: &str = "incident_summary";
    /// Bounded excerpt of the raw incident log.
    pub const RAW_LOG_EXCERPT: &str = "raw_log_excerpt";
    /// Service/interface mapping produced by asset collection.
    pub const ASSET_MAPPING: &str = "asset_mapping";
    /// Rolling one-line-per-agent summary accumulated across rounds.
    pub const ACCUMULATED_SUMMARY: &str = "accumulated_summary";
    /// Supervisor routing notes, one entry per decision.
    pub const SUPERVISOR_NOTES: &str = "supervisor_notes";
    /// Rendered report document, written by the report node.
    pub const REPORT_DOCUMENT: &str = "report_document";
}
