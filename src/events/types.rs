//! Event envelope and payload types.
//!
//! Every state-mutating action emits at least one event. Envelopes are
//! schema-stable: serialize → deserialize → serialize is a fixed point, and
//! `event_id` is derived from content so identical replays produce identical
//! ids across restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::state::{DebatePhase, RiskLevel, ToolUse};
use crate::tools::{ToolKind, ToolStatus};

/// Derive a stable event id from its production coordinates:
/// `evt_` + first 16 hex chars of SHA-256(`session_id|node|sequence_index`).
pub fn derive_event_id(session_id: &str, node: &str, sequence_index: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update(b"|");
    hasher.update(node.as_bytes());
    hasher.update(b"|");
    hasher.update(sequence_index.to_string().as_bytes());
    let digest = hasher.finalize();
    format!("evt_{}", hex::encode(&digest[..8]))
}

/// Typed event payload. The serialized form carries a snake_case `type` tag
/// alongside the variant's fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// The session began executing.
    SessionStarted { incident_id: String },

    /// The session reached terminal status Completed.
    SessionCompleted { rounds: u32 },

    /// The session reached terminal status Failed.
    SessionFailed {
        error_code: String,
        error_message: String,
        retry_hint: String,
    },

    /// The session was cooperatively cancelled.
    SessionCancelled { reason: String },

    /// The debate advanced to a new phase.
    PhaseChanged {
        from: DebatePhase,
        to: DebatePhase,
        loop_round: u32,
        reason: String,
    },

    /// The supervisor issued a command to a specialist.
    AgentCommandIssued {
        target: String,
        round: u32,
        task: String,
        use_tool: ToolUse,
    },

    /// A conversational turn was appended to the transcript.
    AgentChatMessage {
        message_id: String,
        role: String,
        content: String,
    },

    /// One agent round settled (card payload for UI rendering).
    AgentRound {
        round: u32,
        status: String,
        conclusion: String,
        confidence: f64,
        evidence_count: usize,
    },

    /// Tool context was assembled for an agent ahead of its LLM call.
    AgentToolContextPrepared {
        tool: ToolKind,
        status: ToolStatus,
        summary: String,
    },

    /// One audited tool invocation.
    AgentToolIo {
        tool: ToolKind,
        action: String,
        status: ToolStatus,
        outcome_summary: String,
    },

    /// An LLM request attempt began.
    LlmRequestStarted {
        request_id: String,
        model_id: String,
        attempt: u32,
    },

    /// The paired completion for a started request.
    LlmRequestCompleted {
        request_id: String,
        model_id: String,
        latency_ms: u64,
        prompt_tokens: u64,
        completion_tokens: u64,
    },

    /// The paired failure for a started request.
    LlmRequestFailed {
        request_id: String,
        model_id: String,
        latency_ms: u64,
        reason: String,
    },

    /// The paired timeout for a started request.
    LlmRequestTimeout {
        request_id: String,
        model_id: String,
        latency_ms: u64,
        attempt: u32,
    },

    /// Asset collection produced a service/interface mapping.
    AssetInterfaceMappingCompleted { interface_count: usize },

    /// A validated final result is available.
    ResultReady {
        root_cause: String,
        confidence: f64,
        risk_level: RiskLevel,
    },

    /// A slow consumer lagged; `skipped` events were dropped oldest-first.
    StreamLag { skipped: u64 },
}

impl EventKind {
    /// Snake-case type name, matching the serialized `type` tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session_started",
            Self::SessionCompleted { .. } => "session_completed",
            Self::SessionFailed { .. } => "session_failed",
            Self::SessionCancelled { .. } => "session_cancelled",
            Self::PhaseChanged { .. } => "phase_changed",
            Self::AgentCommandIssued { .. } => "agent_command_issued",
            Self::AgentChatMessage { .. } => "agent_chat_message",
            Self::AgentRound { .. } => "agent_round",
            Self::AgentToolContextPrepared { .. } => "agent_tool_context_prepared",
            Self::AgentToolIo { .. } => "agent_tool_io",
            Self::LlmRequestStarted { .. } => "llm_request_started",
            Self::LlmRequestCompleted { .. } => "llm_request_completed",
            Self::LlmRequestFailed { .. } => "llm_request_failed",
            Self::LlmRequestTimeout { .. } => "llm_request_timeout",
            Self::AssetInterfaceMappingCompleted { .. } => {
                "asset_interface_mapping_completed"
            }
            Self::ResultReady { .. } => "result_ready",
            Self::StreamLag { .. } => "stream_lag",
        }
    }
}

/// The event envelope delivered to subscribers and persisted to the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebateEvent {
    /// Stable id; empty until the dispatcher assigns one.
    #[serde(default)]
    pub event_id: String,
    /// Owning session.
    pub session_id: String,
    /// Production timestamp.
    pub timestamp: DateTime<Utc>,
    /// Phase the event was produced in.
    pub phase: DebatePhase,
    /// Producing agent, when agent-scoped.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub agent_name: Option<String>,
    /// Typed payload; serialized inline with a `type` tag.
    #[serde(flatten)]
    pub kind: EventKind,
}

impl DebateEvent {
    /// Build an envelope with no id; the dispatcher assigns one on emit.
    pub fn new(session_id: &str, phase: DebatePhase, kind: EventKind) -> Self {
        Self {
            event_id: String::new(),
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            phase,
            agent_name: None,
            kind,
        }
    }

    /// Attach the producing agent.
    pub fn with_agent(mut self, agent_name: &str) -> Self {
        self.agent_name = Some(agent_name.to_string());
        self
    }

    /// Serialized type tag of the payload.
    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_id_deterministic() {
        let a = derive_event_id("sess-1", "aggregate", 7);
        let b = derive_event_id("sess-1", "aggregate", 7);
        assert_eq!(a, b);
        assert!(a.starts_with("evt_"));

        let c = derive_event_id("sess-1", "aggregate", 8);
        assert_ne!(a, c);
        let d = derive_event_id("sess-2", "aggregate", 7);
        assert_ne!(a, d);
    }

    #[test]
    fn test_serde_round_trip_fixed_point() {
        let event = DebateEvent {
            event_id: derive_event_id("sess-1", "judge", 3),
            session_id: "sess-1".to_string(),
            timestamp: Utc::now(),
            phase: DebatePhase::Judgment,
            agent_name: Some("JudgeAgent".to_string()),
            kind: EventKind::LlmRequestCompleted {
                request_id: "req_1".to_string(),
                model_id: "judge-large".to_string(),
                latency_ms: 812,
                prompt_tokens: 1200,
                completion_tokens: 240,
            },
        };

        let first = serde_json::to_string(&event).unwrap();
        let parsed: DebateEvent = serde_json::from_str(&first).unwrap();
        let second = serde_json::to_string(&parsed).unwrap();
        assert_eq!(first, second);
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_type_tag_is_snake_case() {
        let event = DebateEvent::new(
            "sess-1",
            DebatePhase::Analysis,
            EventKind::AgentCommandIssued {
                target: "LogAgent".to_string(),
                round: 1,
                task: "scan".to_string(),
                use_tool: ToolUse::Optional,
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "agent_command_issued");
        assert_eq!(json["phase"], "analysis");
        assert_eq!(event.type_name(), "agent_command_issued");
    }

    #[test]
    fn test_agent_name_omitted_when_absent() {
        let event = DebateEvent::new(
            "sess-1",
            DebatePhase::Init,
            EventKind::SessionStarted {
                incident_id: "inc-1".to_string(),
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("agent_name").is_none());
    }

    #[test]
    fn test_all_enumerated_types_have_names() {
        // Spot checks over the enumerated minimum set.
        for (kind, expected) in [
            (
                EventKind::SessionCancelled {
                    reason: "manual".into(),
                },
                "session_cancelled",
            ),
            (
                EventKind::AssetInterfaceMappingCompleted { interface_count: 4 },
                "asset_interface_mapping_completed",
            ),
            (EventKind::StreamLag { skipped: 3 }, "stream_lag"),
        ] {
            assert_eq!(kind.type_name(), expected);
        }
    }
}
