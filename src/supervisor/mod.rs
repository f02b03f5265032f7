//! Supervisor routing — two layered deciders.
//!
//! The rule-based decider handles deterministic phase progression; the
//! LLM-dynamic decider is consulted only when the rules defer (picking the
//! focus of another critique round is judgment-heavy, the rest is
//! mechanical). An LLM decision that violates the phase order is rejected
//! and the rule default applies, so a hallucinating supervisor can never
//! corrupt the debate.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::agents::{parse_structured_output, supervisor_prompt_messages, AgentRegistry};
use crate::config::DebateConfig;
use crate::gateway::{GatewayError, LlmGateway, LlmRequest};
use crate::session::CancelFlag;
use crate::state::{
    AgentCommand, DebatePhase, DebateState, FeedbackStatus, ToolUse,
};

/// Which decider stack the session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorMode {
    /// Rule-based only; the LLM is never consulted.
    Rule,
    /// LLM first; the rule guardrail still validates every decision.
    Llm,
    /// Rule-based first, LLM only on defer (default).
    Hybrid,
}

impl std::fmt::Display for SupervisorMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Rule => "rule",
            Self::Llm => "llm",
            Self::Hybrid => "hybrid",
        };
        write!(f, "{name}")
    }
}

/// A routing decision: the phase to enter and the commands to issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDecision {
    /// Phase to enter.
    pub next_phase: DebatePhase,
    /// Commands to issue, keyed by agent name.
    pub commands: BTreeMap<String, AgentCommand>,
    /// Why this route was chosen (recorded as a supervisor note).
    pub reason: String,
    /// Loop round the commands belong to.
    pub round: u32,
}

/// Rule decider output.
#[derive(Debug, Clone)]
pub enum RuleOutcome {
    Decision(RouteDecision),
    /// The rules cannot pick a useful focus; consult the LLM.
    Defer {
        /// The decision to fall back on if the LLM also fails.
        fallback: RouteDecision,
    },
}

/// Error type for supervisor decisions.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("session cancelled")]
    Cancelled,

    #[error("llm decision rejected: {0}")]
    DecisionRejected(String),
}

impl From<GatewayError> for SupervisorError {
    fn from(error: GatewayError) -> Self {
        match error {
            GatewayError::Cancelled => Self::Cancelled,
            GatewayError::Exhausted { reason, .. } => Self::DecisionRejected(reason),
        }
    }
}

/// The layered supervisor router.
pub struct SupervisorRouter {
    config: Arc<DebateConfig>,
    registry: Arc<AgentRegistry>,
    gateway: Arc<LlmGateway>,
}

impl SupervisorRouter {
    pub fn new(
        config: Arc<DebateConfig>,
        registry: Arc<AgentRegistry>,
        gateway: Arc<LlmGateway>,
    ) -> Self {
        Self {
            config,
            registry,
            gateway,
        }
    }

    /// Decide the next route. Never fails except on cancellation: rejected
    /// or unavailable LLM decisions fall back to the rule default.
    pub async fn decide(
        &self,
        state: &DebateState,
        cancel: &CancelFlag,
    ) -> Result<RouteDecision, SupervisorError> {
        let rule = self.rule_decide(state);
        match (self.config.supervisor_mode, rule) {
            (SupervisorMode::Rule, RuleOutcome::Decision(decision)) => Ok(decision),
            (SupervisorMode::Rule, RuleOutcome::Defer { fallback }) => Ok(fallback),
            (SupervisorMode::Hybrid, RuleOutcome::Decision(decision)) => Ok(decision),
            (SupervisorMode::Hybrid, RuleOutcome::Defer { fallback })
            | (SupervisorMode::Llm, RuleOutcome::Decision(fallback))
            | (SupervisorMode::Llm, RuleOutcome::Defer { fallback }) => {
                match self.llm_decide(state, &fallback, cancel).await {
                    Ok(decision) => Ok(decision),
                    Err(SupervisorError::Cancelled) => Err(SupervisorError::Cancelled),
                    Err(error) => {
                        warn!(%error, "llm supervisor rejected; using rule fallback");
                        Ok(fallback)
                    }
                }
            }
        }
    }

    /// Deterministic phase progression.
    pub fn rule_decide(&self, state: &DebateState) -> RuleOutcome {
        let phase = state.route.current_phase;
        let round = state.route.loop_round;
        let config = &self.config;

        match phase {
            DebatePhase::AssetMapping => RuleOutcome::Decision(self.analysis_dispatch(round)),
            DebatePhase::Analysis => {
                let specialists = self.registry.analysis_specialists();
                let low_confidence = specialists.iter().any(|name| {
                    state
                        .feedback
                        .get(name)
                        .map(|fb| {
                            fb.status == FeedbackStatus::Ok
                                && fb.confidence < config.confidence_threshold_low
                        })
                        .unwrap_or(false)
                });
                let conflicting = specialists.iter().any(|name| {
                    state
                        .feedback
                        .get(name)
                        .map(|fb| !fb.open_questions.is_empty())
                        .unwrap_or(false)
                });
                if low_confidence || conflicting {
                    RuleOutcome::Decision(self.critique_dispatch(state, round + 1))
                } else {
                    let unanimous = specialists.iter().all(|name| {
                        state
                            .feedback
                            .get(name)
                            .map(|fb| fb.confidence >= config.consensus_threshold)
                            .unwrap_or(true)
                    });
                    let reason = if unanimous {
                        "specialists aligned above the consensus threshold"
                    } else {
                        "analysis confident enough to adjudicate"
                    };
                    RuleOutcome::Decision(self.judgment_dispatch(round, reason))
                }
            }
            DebatePhase::Critique => {
                RuleOutcome::Decision(self.rebuttal_dispatch(state, round))
            }
            DebatePhase::Rebuttal => {
                if round >= config.max_rounds {
                    return RuleOutcome::Decision(
                        self.judgment_dispatch(round, "max rounds reached"),
                    );
                }
                if self.judge_ready(state) {
                    return RuleOutcome::Decision(
                        self.judgment_dispatch(round, "open questions addressed"),
                    );
                }
                // Another critique round: focus selection is where the
                // dynamic supervisor earns its keep.
                RuleOutcome::Defer {
                    fallback: self.critique_dispatch(state, round + 1),
                }
            }
            DebatePhase::Judgment => RuleOutcome::Decision(RouteDecision {
                next_phase: DebatePhase::Verification,
                commands: BTreeMap::new(),
                reason: "judgment recorded, verifying".to_string(),
                round,
            }),
            DebatePhase::Verification => RuleOutcome::Decision(RouteDecision {
                next_phase: DebatePhase::Report,
                commands: BTreeMap::new(),
                reason: "verification recorded, reporting".to_string(),
                round,
            }),
            DebatePhase::Init | DebatePhase::Report | DebatePhase::Terminal => {
                RuleOutcome::Decision(RouteDecision {
                    next_phase: phase,
                    commands: BTreeMap::new(),
                    reason: "no routing decision needed".to_string(),
                    round,
                })
            }
        }
    }

    /// Judge-readiness heuristic (tunable default): every specialist that
    /// posted usable feedback has an empty `missing_info` list.
    fn judge_ready(&self, state: &DebateState) -> bool {
        let mut any = false;
        for name in self.registry.analysis_specialists() {
            if let Some(feedback) = state.feedback.get(&name) {
                if feedback.status == FeedbackStatus::Ok {
                    any = true;
                    if !feedback.missing_info.is_empty() {
                        return false;
                    }
                }
            }
        }
        any
    }

    fn analysis_dispatch(&self, round: u32) -> RouteDecision {
        let round = round.max(1);
        let mut commands = BTreeMap::new();
        for name in self.registry.analysis_specialists() {
            commands.insert(
                name.clone(),
                self.make_command(
                    &name,
                    DebatePhase::Analysis,
                    round,
                    "analyze the incident within your specialty and cite concrete evidence",
                    "independent first-pass analysis",
                ),
            );
        }
        RouteDecision {
            next_phase: DebatePhase::Analysis,
            commands,
            reason: "asset mapping usable, fanning out specialists".to_string(),
            round,
        }
    }

    fn critique_dispatch(&self, state: &DebateState, round: u32) -> RouteDecision {
        let focus = state
            .feedback
            .iter()
            .filter(|(_, fb)| !fb.open_questions.is_empty())
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let focus = if focus.is_empty() {
            "lowest-confidence claims".to_string()
        } else {
            format!("open questions raised by {focus}")
        };
        let mut commands = BTreeMap::new();
        commands.insert(
            "CriticAgent".to_string(),
            self.make_command(
                "CriticAgent",
                DebatePhase::Critique,
                round,
                "challenge the specialists' claims and name every weak conclusion",
                &focus,
            ),
        );
        RouteDecision {
            next_phase: DebatePhase::Critique,
            commands,
            reason: "confidence gap or conflict detected, entering critique".to_string(),
            round,
        }
    }

    fn rebuttal_dispatch(&self, state: &DebateState, round: u32) -> RouteDecision {
        // Command every specialist whose claim was challenged; the critic
        // names targets in its structured output.
        let mut challenged: Vec<String> = state
            .agent_outputs
            .get("CriticAgent")
            .and_then(|output| output.get("challenges"))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|c| c.get("agent"))
                    .filter_map(Value::as_str)
                    .filter(|name| self.registry.contains(name))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        challenged.sort();
        challenged.dedup();
        if challenged.is_empty() {
            // Nothing parseable from the critic: every specialist that
            // spoke defends its claim.
            challenged = self
                .registry
                .analysis_specialists()
                .into_iter()
                .filter(|name| state.feedback.contains_key(name))
                .collect();
        }
        let mut commands = BTreeMap::new();
        for name in challenged {
            commands.insert(
                name.clone(),
                self.make_command(
                    &name,
                    DebatePhase::Rebuttal,
                    round,
                    "respond to the critic's challenge: concede or defend with evidence",
                    "the challenge against your claim",
                ),
            );
        }
        RouteDecision {
            next_phase: DebatePhase::Rebuttal,
            commands,
            reason: "critique recorded, challenged specialists respond".to_string(),
            round,
        }
    }

    fn judgment_dispatch(&self, round: u32, reason: &str) -> RouteDecision {
        let mut commands = BTreeMap::new();
        commands.insert(
            "JudgeAgent".to_string(),
            self.make_command(
                "JudgeAgent",
                DebatePhase::Judgment,
                round,
                "adjudicate the debate into a single evidenced root cause",
                "all findings, challenges, and rebuttals",
            ),
        );
        RouteDecision {
            next_phase: DebatePhase::Judgment,
            commands,
            reason: reason.to_string(),
            round,
        }
    }

    fn make_command(
        &self,
        agent: &str,
        phase: DebatePhase,
        round: u32,
        task: &str,
        focus: &str,
    ) -> AgentCommand {
        let descriptor = self.registry.get(agent);
        let tool_targets = descriptor
            .map(|d| d.allowed_tools.clone())
            .unwrap_or_default();
        let use_tool = if tool_targets.is_empty() {
            ToolUse::Forbidden
        } else {
            ToolUse::Optional
        };
        AgentCommand {
            issued_round: round,
            task: task.to_string(),
            focus: focus.to_string(),
            expected_output_schema_id: descriptor
                .map(|d| d.output_schema_id.clone())
                .unwrap_or_else(|| "specialist_v1".to_string()),
            use_tool,
            tool_targets,
            deadline_ms: self.config.phase_timeout_ms(phase),
        }
    }

    /// Consult the supervisor LLM with the condensed debate state. Its
    /// decision must pass the phase-order guardrail or it is rejected.
    async fn llm_decide(
        &self,
        state: &DebateState,
        fallback: &RouteDecision,
        cancel: &CancelFlag,
    ) -> Result<RouteDecision, SupervisorError> {
        let eligible = self.registry.analysis_specialists();
        let messages =
            supervisor_prompt_messages(state, &eligible, self.config.max_prompt_tokens);

        let outcome = self
            .gateway
            .call(
                LlmRequest {
                    model_id: self.config.supervisor_model.clone(),
                    agent_name: "Supervisor".to_string(),
                    phase: state.route.current_phase,
                    messages,
                    expected_schema_id: Some("supervisor_v1".to_string()),
                    deadline_ms: self.config.phase_timeout_ms(state.route.current_phase),
                    profile: crate::gateway::RetryProfile::supervisor(),
                },
                cancel,
            )
            .await?;
        if !outcome.is_ok() {
            return Err(SupervisorError::DecisionRejected(
                "supervisor llm degraded".to_string(),
            ));
        }

        let parsed = parse_structured_output(&outcome.text);
        if !parsed.structured_ok {
            return Err(SupervisorError::DecisionRejected(
                "unstructured supervisor output".to_string(),
            ));
        }

        let should_stop = parsed
            .value
            .get("should_stop")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if should_stop {
            // Stopping is only honored once the judge has spoken in the
            // current judgment phase; then the route moves forward.
            if state.agent_outputs.contains_key("JudgeAgent")
                && state.route.current_phase == DebatePhase::Judgment
            {
                return Ok(RouteDecision {
                    next_phase: DebatePhase::Verification,
                    commands: BTreeMap::new(),
                    reason: "supervisor requested stop".to_string(),
                    round: fallback.round,
                });
            }
            // No adjudication yet, or one left over from an earlier epoch:
            // dispatch the judge at a round it has not yet answered, so the
            // judgment routing re-pends it instead of spinning.
            if !state
                .route
                .current_phase
                .can_advance_to(DebatePhase::Judgment)
            {
                return Err(SupervisorError::DecisionRejected(format!(
                    "stop requested but {} cannot advance to judgment",
                    state.route.current_phase
                )));
            }
            let round = match state.feedback.get("JudgeAgent") {
                Some(feedback) if feedback.round >= fallback.round => fallback.round + 1,
                _ => fallback.round,
            };
            debug!("supervisor stop without a current adjudication; dispatching judge");
            return Ok(self.judgment_dispatch(round, "stop requested, judge first"));
        }

        let commands_raw = parsed
            .value
            .get("commands")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut commands = BTreeMap::new();
        for item in commands_raw.iter().take(8) {
            let Some(target) = item.get("target_agent").and_then(Value::as_str) else {
                continue;
            };
            if !self.registry.contains(target) {
                return Err(SupervisorError::DecisionRejected(format!(
                    "unknown agent {target}"
                )));
            }
            let task = item.get("task").and_then(Value::as_str).unwrap_or_default();
            let focus = item.get("focus").and_then(Value::as_str).unwrap_or_default();
            let mut command = self.make_command(
                target,
                fallback.next_phase,
                fallback.round,
                task,
                focus,
            );
            if let Some(use_tool) = item.get("use_tool").and_then(Value::as_str) {
                command.use_tool = match use_tool {
                    "forbidden" => ToolUse::Forbidden,
                    "required" => ToolUse::Required,
                    _ => ToolUse::Optional,
                };
            }
            commands.insert(target.to_string(), command);
        }
        if commands.is_empty() {
            return Err(SupervisorError::DecisionRejected(
                "no usable commands in supervisor decision".to_string(),
            ));
        }

        // Guardrail: the LLM may refine targets/focus but not the phase.
        let next_phase = fallback.next_phase;
        if !state.route.current_phase.can_advance_to(next_phase) {
            return Err(SupervisorError::DecisionRejected(format!(
                "phase order violation {} → {}",
                state.route.current_phase, next_phase
            )));
        }

        let rationale = parsed
            .value
            .get("rationale")
            .and_then(Value::as_str)
            .unwrap_or("dynamic supervisor decision")
            .to_string();
        Ok(RouteDecision {
            next_phase,
            commands,
            reason: rationale,
            round: fallback.round,
        })
    }
}
