//! The delta merge protocol: a [`StateDelta`] is a partial state whose
//! per-field values are combined with each field's declared reducer.
//!
//! Reducers are commutative within a single parallel fan-out step: two
//! specialists writing to disjoint keys of `agent_outputs` or `feedback`
//! produce the same state regardless of merge order. The transcript is the
//! deliberate exception: messages append in settlement order, which the
//! concurrency model permits.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::types::{
    AgentCommand, AgentFeedback, DebateMessage, DebateMetrics, DebatePhase, DebateState,
    Evidence, FinalResult, MessageRole, RouteState,
};

/// Rejection reasons for a delta that would corrupt the state.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The delta's route change violates the monotone phase order.
    #[error("invalid state delta: phase order violation {from} → {to}")]
    PhaseOrderViolation { from: DebatePhase, to: DebatePhase },

    /// Feedback cites an evidence id that exists in neither the state nor
    /// the delta.
    #[error("invalid state delta: {agent} cites unknown evidence {evidence_id}")]
    UnknownEvidenceRef { agent: String, evidence_id: String },

    /// `final_result` is set-once.
    #[error("invalid state delta: final_result already set")]
    FinalResultAlreadySet,

    /// Only the judgment phase may write `final_result`.
    #[error("invalid state delta: final_result written outside judgment (phase {phase})")]
    FinalResultOutsideJudgment { phase: DebatePhase },

    /// The adjudication must cite ≥2 evidence items from ≥2 source kinds.
    #[error(
        "invalid state delta: final_result cites {items} evidence items \
         across {kinds} source kinds (need ≥2 of each)"
    )]
    InsufficientEvidence { items: usize, kinds: usize },
}

/// A partial state produced by one node execution.
///
/// Empty fields merge as no-ops, so a delta built with
/// [`StateDelta::default`] and a handful of `with_*` calls stays cheap.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDelta {
    /// Messages to append (id-deduplicated).
    pub messages: Vec<DebateMessage>,
    /// Context keys to merge, last-writer-wins per key.
    pub context: BTreeMap<String, serde_json::Value>,
    /// Commands to set, per-key replace.
    pub commands: BTreeMap<String, AgentCommand>,
    /// Feedback to set, per-key replace.
    pub feedback: BTreeMap<String, AgentFeedback>,
    /// Evidence to insert (content-hash deduplicated).
    pub evidence: Vec<Evidence>,
    /// Structured outputs to set, per-key replace.
    pub agent_outputs: BTreeMap<String, serde_json::Value>,
    /// Route replacement, if any.
    pub route: Option<RouteState>,
    /// Counters to add element-wise.
    pub metrics: DebateMetrics,
    /// Set-once adjudication.
    pub final_result: Option<FinalResult>,
}

impl StateDelta {
    /// Append a message.
    pub fn with_message(mut self, message: DebateMessage) -> Self {
        self.messages.push(message);
        self
    }

    /// Append a freshly-constructed message.
    pub fn with_new_message(
        self,
        role: MessageRole,
        agent_name: &str,
        phase: DebatePhase,
        content: &str,
    ) -> Self {
        self.with_message(DebateMessage::new(role, agent_name, phase, content))
    }

    /// Set a context key.
    pub fn with_context(mut self, key: &str, value: serde_json::Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }

    /// Set a command for an agent.
    pub fn with_command(mut self, agent: &str, command: AgentCommand) -> Self {
        self.commands.insert(agent.to_string(), command);
        self
    }

    /// Set feedback for an agent.
    pub fn with_feedback(mut self, agent: &str, feedback: AgentFeedback) -> Self {
        self.feedback.insert(agent.to_string(), feedback);
        self
    }

    /// Insert an evidence item.
    pub fn with_evidence(mut self, evidence: Evidence) -> Self {
        self.evidence.push(evidence);
        self
    }

    /// Set an agent's raw structured output.
    pub fn with_agent_output(mut self, agent: &str, output: serde_json::Value) -> Self {
        self.agent_outputs.insert(agent.to_string(), output);
        self
    }

    /// Replace the route.
    pub fn with_route(mut self, route: RouteState) -> Self {
        self.route = Some(route);
        self
    }

    /// Set the adjudication.
    pub fn with_final_result(mut self, result: FinalResult) -> Self {
        self.final_result = Some(result);
        self
    }

    /// Whether this delta carries no changes at all.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.context.is_empty()
            && self.commands.is_empty()
            && self.feedback.is_empty()
            && self.evidence.is_empty()
            && self.agent_outputs.is_empty()
            && self.route.is_none()
            && self.metrics.is_empty()
            && self.final_result.is_none()
    }

    /// Fold `other` into `self`, field by field, using the same reducers as
    /// [`DebateState::apply`]. Used by fan-in to collapse settled deltas
    /// before a single validated apply.
    pub fn merge(&mut self, other: StateDelta) {
        self.messages.extend(other.messages);
        self.context.extend(other.context);
        self.commands.extend(other.commands);
        self.feedback.extend(other.feedback);
        self.evidence.extend(other.evidence);
        self.agent_outputs.extend(other.agent_outputs);
        if other.route.is_some() {
            self.route = other.route;
        }
        self.metrics.absorb(&other.metrics);
        if self.final_result.is_none() {
            self.final_result = other.final_result;
        }
    }
}

impl DebateState {
    /// Atomically merge a delta into the state.
    ///
    /// Validation happens before any mutation, so a rejected delta leaves
    /// the state untouched.
    pub fn apply(&mut self, delta: StateDelta) -> Result<(), StateError> {
        self.validate(&delta)?;

        // messages: append with id-based de-duplication (both against the
        // existing transcript and within the delta itself)
        let mut seen: BTreeSet<String> =
            self.messages.iter().map(|m| m.id.clone()).collect();
        for message in delta.messages {
            if seen.insert(message.id.clone()) {
                self.messages.push(message);
            }
        }

        // context: shallow merge, last-writer-wins per key
        self.context.extend(delta.context);

        // commands / feedback / agent_outputs: per-key replace
        self.commands.extend(delta.commands);
        self.feedback.extend(delta.feedback);
        self.agent_outputs.extend(delta.agent_outputs);

        // evidence: ordered insert, de-dup by content id
        for item in delta.evidence {
            if !self.has_evidence(&item.evidence_id) {
                self.evidence.push(item);
            }
        }

        // route: replace
        if let Some(route) = delta.route {
            self.route = route;
        }

        // metrics: element-wise add
        self.metrics.absorb(&delta.metrics);

        // final_result: set-once
        if let Some(result) = delta.final_result {
            self.final_result = Some(result);
        }

        Ok(())
    }

    fn validate(&self, delta: &StateDelta) -> Result<(), StateError> {
        // I3: phase order is monotone.
        if let Some(route) = &delta.route {
            let from = self.route.current_phase;
            let to = route.current_phase;
            if !from.can_advance_to(to) {
                return Err(StateError::PhaseOrderViolation { from, to });
            }
        }

        // I1: every cited evidence id must resolve against the state or the
        // same delta.
        let delta_ids: BTreeSet<&str> = delta
            .evidence
            .iter()
            .map(|e| e.evidence_id.as_str())
            .collect();
        for (agent, feedback) in &delta.feedback {
            for evidence_id in &feedback.evidence_refs {
                if !self.has_evidence(evidence_id) && !delta_ids.contains(evidence_id.as_str())
                {
                    return Err(StateError::UnknownEvidenceRef {
                        agent: agent.clone(),
                        evidence_id: evidence_id.clone(),
                    });
                }
            }
        }

        // I4: final_result is judgment-only, set-once, and must cite ≥2
        // evidence items from ≥2 distinct source kinds.
        if let Some(result) = &delta.final_result {
            if self.final_result.is_some() {
                return Err(StateError::FinalResultAlreadySet);
            }
            let phase = delta
                .route
                .as_ref()
                .map(|r| r.current_phase)
                .unwrap_or(self.route.current_phase);
            if phase != DebatePhase::Judgment {
                return Err(StateError::FinalResultOutsideJudgment { phase });
            }
            for evidence_id in &result.evidence_chain {
                if !self.has_evidence(evidence_id) && !delta_ids.contains(evidence_id.as_str())
                {
                    return Err(StateError::UnknownEvidenceRef {
                        agent: "JudgeAgent".to_string(),
                        evidence_id: evidence_id.clone(),
                    });
                }
            }
            let mut kinds = BTreeSet::new();
            for evidence_id in &result.evidence_chain {
                if let Some(item) = self.evidence_by_id(evidence_id) {
                    kinds.insert(item.source_kind);
                } else if let Some(item) =
                    delta.evidence.iter().find(|e| &e.evidence_id == evidence_id)
                {
                    kinds.insert(item.source_kind);
                }
            }
            if result.evidence_chain.len() < 2 || kinds.len() < 2 {
                return Err(StateError::InsufficientEvidence {
                    items: result.evidence_chain.len(),
                    kinds: kinds.len(),
                });
            }
        }

        Ok(())
    }
}
