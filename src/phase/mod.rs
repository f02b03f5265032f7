//! Phase executor — bounded parallel fan-out over commanded agents with
//! settle-all fan-in.
//!
//! Every targeted agent runs against the same state snapshot, so no
//! specialist observes another's output within the same fan-out; cross-agent
//! observation happens only via the next supervisor round. Settlement order
//! determines message order within the phase. A timed-out or failed task
//! degrades its agent only; the phase itself always advances.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::agents::{AgentRunner, RunnerError};
use crate::session::CancelFlag;
use crate::state::{AgentFeedback, DebateState, StateDelta};

/// How one fan-out task settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleOutcome {
    /// The runner produced a delta.
    Completed,
    /// The per-agent deadline elapsed before the runner finished.
    TimedOut,
    /// The task failed outside the runner's own absorption (panic or
    /// join error).
    Failed(String),
}

/// One settled agent with its delta (present only for `Completed`).
#[derive(Debug)]
pub struct SettledAgent {
    pub agent: String,
    pub outcome: SettleOutcome,
    pub delta: Option<StateDelta>,
    pub elapsed_ms: u64,
}

/// Error type for the phase executor. Only cancellation escapes; it
/// carries the agents that had already settled so their events can still
/// be recorded (their state deltas are discarded with the fan-out).
#[derive(Debug, thiserror::Error)]
pub enum PhaseError {
    #[error("session cancelled")]
    Cancelled { settled: Vec<SettledAgent> },
}

/// Poll interval for the cooperative cancel flag while awaiting
/// settlements.
const CANCEL_POLL_MS: u64 = 25;

/// Runs a set of commanded agents concurrently, bounded by the session's
/// concurrency limit.
pub struct PhaseExecutor {
    runner: Arc<AgentRunner>,
    concurrency_limit: usize,
}

impl PhaseExecutor {
    pub fn new(runner: Arc<AgentRunner>, concurrency_limit: usize) -> Self {
        Self {
            runner,
            concurrency_limit: concurrency_limit.max(1),
        }
    }

    /// Fan out over `targets` and wait for all of them to settle.
    /// Results arrive in settlement order. Agents whose tasks timed out or
    /// failed carry a synthesized degraded-feedback delta so the round
    /// still completes (invariant: every commanded agent posts exactly one
    /// feedback entry per round).
    pub async fn run_phase(
        &self,
        targets: &[String],
        state: Arc<DebateState>,
        cancel: &CancelFlag,
    ) -> Result<Vec<SettledAgent>, PhaseError> {
        if cancel.is_cancelled() {
            return Err(PhaseError::Cancelled {
                settled: Vec::new(),
            });
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency_limit));
        let round = state.route.loop_round;
        let mut join_set: JoinSet<SettledAgent> = JoinSet::new();

        for agent in targets {
            let agent = agent.clone();
            let runner = self.runner.clone();
            let semaphore = semaphore.clone();
            let state = state.clone();
            let cancel = cancel.clone();
            let deadline_ms = state
                .commands
                .get(&agent)
                .map(|command| command.deadline_ms)
                .unwrap_or(60_000);

            join_set.spawn(async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return SettledAgent {
                            agent,
                            outcome: SettleOutcome::Failed("semaphore closed".to_string()),
                            delta: None,
                            elapsed_ms: 0,
                        };
                    }
                };
                let started = Instant::now();
                let result = tokio::time::timeout(
                    Duration::from_millis(deadline_ms.saturating_mul(2).max(deadline_ms)),
                    runner.run(&agent, state, &cancel),
                )
                .await;
                let elapsed_ms = started.elapsed().as_millis() as u64;
                match result {
                    Ok(Ok(delta)) => SettledAgent {
                        agent,
                        outcome: SettleOutcome::Completed,
                        delta: Some(delta),
                        elapsed_ms,
                    },
                    Ok(Err(RunnerError::Cancelled)) => SettledAgent {
                        agent,
                        outcome: SettleOutcome::Failed("cancelled".to_string()),
                        delta: None,
                        elapsed_ms,
                    },
                    Err(_) => SettledAgent {
                        agent,
                        outcome: SettleOutcome::TimedOut,
                        delta: None,
                        elapsed_ms,
                    },
                }
            });
        }

        let mut settled: Vec<SettledAgent> = Vec::new();
        loop {
            let joined = tokio::select! {
                joined = join_set.join_next() => match joined {
                    Some(joined) => joined,
                    None => break,
                },
                // Cancellation stays responsive even while every worker is
                // mid-flight.
                _ = tokio::time::sleep(Duration::from_millis(CANCEL_POLL_MS)) => {
                    if cancel.is_cancelled() {
                        join_set.abort_all();
                        while join_set.join_next().await.is_some() {}
                        return Err(PhaseError::Cancelled { settled });
                    }
                    continue;
                }
            };
            let mut agent = match joined {
                Ok(agent) => agent,
                Err(error) => {
                    warn!(error = %error, "fan-out worker panicked");
                    continue;
                }
            };
            match &agent.outcome {
                SettleOutcome::Completed => {
                    debug!(agent = %agent.agent, elapsed_ms = agent.elapsed_ms, "agent settled");
                }
                SettleOutcome::TimedOut => {
                    warn!(agent = %agent.agent, "agent timed out; degrading");
                    agent.delta = Some(degraded_delta(
                        &agent.agent,
                        round,
                        "timeout, please continue without this input",
                    ));
                }
                SettleOutcome::Failed(reason) if reason == "cancelled" => {
                    // The cancel flag unwinds at the graph boundary; drop
                    // this agent's partial work without synthesizing
                    // feedback.
                }
                SettleOutcome::Failed(reason) => {
                    warn!(agent = %agent.agent, reason = %reason, "agent failed; degrading");
                    agent.delta = Some(degraded_delta(
                        &agent.agent,
                        round,
                        &format!("agent task failed: {reason}"),
                    ));
                }
            }
            settled.push(agent);

            if cancel.is_cancelled() {
                join_set.abort_all();
                while join_set.join_next().await.is_some() {}
                return Err(PhaseError::Cancelled { settled });
            }
        }

        Ok(settled)
    }
}

fn degraded_delta(agent: &str, round: u32, summary: &str) -> StateDelta {
    let mut delta = StateDelta::default();
    delta
        .feedback
        .insert(agent.to_string(), AgentFeedback::degraded(round, summary));
    delta
}
