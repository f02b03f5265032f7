//! The graph executor — a pump loop awaiting one node at a time.
//!
//! After every node completes, the delta is applied through the reducers,
//! the state is checkpointed, and routing picks the next node. The cancel
//! flag is polled before each node; fatal errors write a terminal
//! checkpoint, emit exactly one `session_failed`, and close the stream.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::builder::{DebateNode, NodeContext, NodeError};
use super::routing::{route, NextNode};
use crate::events::{DebateEvent, EventKind};
use crate::session::{Checkpoint, SharedSessionStore};
use crate::state::{DebatePhase, DebateState, SessionStatus};

/// Runaway-loop backstop, far above any real debate.
const MAX_PUMP_STEPS: usize = 500;

/// Error codes carried by `session_failed` events.
pub mod error_codes {
    pub const INVARIANT_VIOLATION: &str = "INVARIANT_VIOLATION";
    pub const NO_VALID_CONCLUSION: &str = "NO_VALID_CONCLUSION";
    pub const ORCHESTRATION_ERROR: &str = "ORCHESTRATION_ERROR";
}

/// Error type for executor construction problems.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("node {0} is not registered")]
    UnknownNode(String),

    #[error("checkpoint write failed: {0}")]
    CheckpointFailed(String),
}

/// Terminal outcome of one executor run.
#[derive(Debug)]
pub struct ExecutorOutcome {
    pub status: SessionStatus,
    pub state: DebateState,
    pub error_code: Option<String>,
}

/// Pumps the debate graph for one session.
pub struct GraphExecutor {
    ctx: NodeContext,
    nodes: BTreeMap<String, Arc<dyn DebateNode>>,
    store: SharedSessionStore,
}

impl GraphExecutor {
    pub fn new(
        ctx: NodeContext,
        nodes: BTreeMap<String, Arc<dyn DebateNode>>,
        store: SharedSessionStore,
    ) -> Self {
        Self { ctx, nodes, store }
    }

    /// Run until the graph ends, the session fails, or cancellation is
    /// observed. Never panics out: every path produces a terminal
    /// checkpoint and a closing event.
    pub async fn run(&self, mut state: DebateState) -> ExecutorOutcome {
        let session_id = self.ctx.session_id.clone();

        if state.route.current_phase == DebatePhase::Init && state.messages.is_empty() {
            let event = DebateEvent::new(
                &session_id,
                DebatePhase::Init,
                EventKind::SessionStarted {
                    incident_id: self.ctx.incident.id.clone(),
                },
            );
            if let Err(e) = self.ctx.dispatcher.emit("executor", event).await {
                warn!(error = %e, "failed to emit session_started");
            }
        }

        for _step in 0..MAX_PUMP_STEPS {
            // Cooperative cancel, checked before entering each node.
            if self.ctx.cancel.is_cancelled() {
                return self.finish_cancelled(state, "cancel requested").await;
            }

            let node_name = match route(&state) {
                NextNode::End => return self.finish_completed(state).await,
                NextNode::Node(name) => name,
            };
            let Some(node) = self.nodes.get(&node_name).cloned() else {
                let error = GraphError::UnknownNode(node_name.clone());
                return self
                    .finish_failed(
                        state,
                        error_codes::ORCHESTRATION_ERROR,
                        &error.to_string(),
                        "fix the graph wiring and resume",
                    )
                    .await;
            };

            debug!(session_id = %session_id, node = %node_name, "pumping node");
            let started = Instant::now();
            let phase_before = state.route.current_phase;

            let delta = match node.run(&self.ctx, &state).await {
                Ok(delta) => delta,
                Err(NodeError::Cancelled) => {
                    return self.finish_cancelled(state, "cancelled inside node").await;
                }
                Err(NodeError::NoValidConclusion { reason, retry_hint }) => {
                    return self
                        .finish_failed(
                            state,
                            error_codes::NO_VALID_CONCLUSION,
                            &reason,
                            &retry_hint,
                        )
                        .await;
                }
                Err(NodeError::Invariant(violation)) => {
                    return self
                        .finish_failed(
                            state,
                            error_codes::INVARIANT_VIOLATION,
                            &violation.to_string(),
                            "inspect the diagnostic snapshot and resume from the last checkpoint",
                        )
                        .await;
                }
                Err(NodeError::Internal(message)) => {
                    return self
                        .finish_failed(
                            state,
                            error_codes::ORCHESTRATION_ERROR,
                            &message,
                            "resume from the last checkpoint",
                        )
                        .await;
                }
            };

            if let Err(violation) = state.apply(delta) {
                error!(session_id = %session_id, node = %node_name, %violation, "reducer rejected delta");
                return self
                    .finish_failed(
                        state,
                        error_codes::INVARIANT_VIOLATION,
                        &violation.to_string(),
                        "inspect the diagnostic snapshot and resume from the last checkpoint",
                    )
                    .await;
            }

            let phase_after = state.route.current_phase;
            if phase_after != phase_before {
                let event = DebateEvent::new(
                    &session_id,
                    phase_after,
                    EventKind::PhaseChanged {
                        from: phase_before,
                        to: phase_after,
                        loop_round: state.route.loop_round,
                        reason: format!("after {node_name}"),
                    },
                );
                if let Err(e) = self.ctx.dispatcher.emit(&node_name, event).await {
                    warn!(error = %e, "failed to emit phase_changed");
                }
            }

            // Checkpoint after every node completion.
            if let Err(e) = self
                .checkpoint(&state, SessionStatus::Running, &node_name)
                .await
            {
                warn!(session_id = %session_id, error = %e, "checkpoint write failed");
            }
            debug!(
                session_id = %session_id,
                node = %node_name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "node complete"
            );
        }

        self.finish_failed(
            state,
            error_codes::ORCHESTRATION_ERROR,
            "pump step budget exhausted",
            "inspect routing for a loop and resume",
        )
        .await
    }

    async fn checkpoint(
        &self,
        state: &DebateState,
        status: SessionStatus,
        last_node: &str,
    ) -> Result<(), GraphError> {
        let checkpoint = Checkpoint::new(&self.ctx.session_id, status, state.clone(), last_node);
        self.store
            .save_checkpoint(&checkpoint)
            .await
            .map_err(|e| GraphError::CheckpointFailed(e.to_string()))
    }

    async fn finish_completed(&self, state: DebateState) -> ExecutorOutcome {
        info!(session_id = %self.ctx.session_id, "session completed");
        if let Err(e) = self
            .checkpoint(&state, SessionStatus::Completed, "terminal")
            .await
        {
            warn!(error = %e, "terminal checkpoint failed");
        }
        let event = DebateEvent::new(
            &self.ctx.session_id,
            DebatePhase::Terminal,
            EventKind::SessionCompleted {
                rounds: state.route.loop_round,
            },
        );
        if let Err(e) = self.ctx.dispatcher.emit("terminal", event).await {
            warn!(error = %e, "failed to emit session_completed");
        }
        ExecutorOutcome {
            status: SessionStatus::Completed,
            state,
            error_code: None,
        }
    }

    async fn finish_cancelled(&self, state: DebateState, reason: &str) -> ExecutorOutcome {
        info!(session_id = %self.ctx.session_id, reason, "session cancelled");
        if let Err(e) = self
            .checkpoint(&state, SessionStatus::Cancelled, "cancelled")
            .await
        {
            warn!(error = %e, "cancel checkpoint failed");
        }
        let event = DebateEvent::new(
            &self.ctx.session_id,
            state.route.current_phase,
            EventKind::SessionCancelled {
                reason: reason.to_string(),
            },
        );
        if let Err(e) = self.ctx.dispatcher.emit("executor", event).await {
            warn!(error = %e, "failed to emit session_cancelled");
        }
        ExecutorOutcome {
            status: SessionStatus::Cancelled,
            state,
            error_code: None,
        }
    }

    async fn finish_failed(
        &self,
        state: DebateState,
        error_code: &str,
        message: &str,
        retry_hint: &str,
    ) -> ExecutorOutcome {
        error!(
            session_id = %self.ctx.session_id,
            error_code,
            message,
            "session failed"
        );
        if let Err(e) = self.checkpoint(&state, SessionStatus::Failed, "failed").await {
            warn!(error = %e, "failure checkpoint failed");
        }
        let event = DebateEvent::new(
            &self.ctx.session_id,
            state.route.current_phase,
            EventKind::SessionFailed {
                error_code: error_code.to_string(),
                error_message: message.to_string(),
                retry_hint: retry_hint.to_string(),
            },
        );
        if let Err(e) = self.ctx.dispatcher.emit("executor", event).await {
            warn!(error = %e, "failed to emit session_failed");
        }
        ExecutorOutcome {
            status: SessionStatus::Failed,
            state,
            error_code: Some(error_code.to_string()),
        }
    }
}
