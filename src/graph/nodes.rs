//! Registered debate nodes.
//!
//! Each node is a thin orchestration shell: the heavy lifting lives in the
//! agent runner, phase executor, supervisor router, and report guard. Nodes
//! stay idempotent under checkpoint replay: re-running one against the
//! same snapshot produces an equivalent delta.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::builder::{DebateNode, NodeContext, NodeError};
use crate::events::EventKind;
use crate::phase::{PhaseError, SettledAgent};
use crate::state::{
    context_keys, AgentCommand, DebatePhase, DebateState, FinalResult, MessageRole, RiskLevel,
    RouteState, StateDelta, ToolUse,
};
use crate::supervisor::SupervisorError;

/// Marker pinned by the terminal node: routing maps it to `End`.
pub const TERMINAL_END_MARKER: &str = "__end__";

/// Cap on raw log excerpt injected into the context.
const LOG_EXCERPT_MAX_CHARS: usize = 2_000;
/// Cap on interface entries in the asset mapping.
const ASSET_MAX_INTERFACES: usize = 12;

/// Dedicated node name for an agent ("LogAgent" → "agent_log_node").
pub fn agent_node_name(agent: &str) -> String {
    format!(
        "agent_{}_node",
        agent.trim_end_matches("Agent").to_lowercase()
    )
}

// ── init_session ────────────────────────────────────────────────────

/// Seeds the debate context from the incident and opens asset mapping.
pub struct InitSessionNode;

#[async_trait]
impl DebateNode for InitSessionNode {
    fn name(&self) -> &str {
        "init_session"
    }

    async fn run(
        &self,
        ctx: &NodeContext,
        _state: &DebateState,
    ) -> Result<StateDelta, NodeError> {
        let incident = &ctx.incident;
        let summary = format!(
            "[{}] {} — {} (service={}, environment={})",
            incident.severity, incident.title, incident.description, incident.service,
            incident.environment
        );
        let excerpt: String = incident
            .log_content
            .chars()
            .take(LOG_EXCERPT_MAX_CHARS)
            .collect();

        let delta = StateDelta::default()
            .with_context(context_keys::INCIDENT_SUMMARY, Value::String(summary))
            .with_context(context_keys::RAW_LOG_EXCERPT, Value::String(excerpt))
            .with_new_message(
                MessageRole::System,
                "system",
                DebatePhase::Init,
                &format!("debate session opened for incident {}", incident.id),
            )
            .with_route(RouteState {
                current_phase: DebatePhase::AssetMapping,
                next_node: None,
                loop_round: 0,
            });
        Ok(delta)
    }
}

// ── collect_assets ──────────────────────────────────────────────────

/// Builds the service/interface mapping from the incident log content.
pub struct CollectAssetsNode;

#[async_trait]
impl DebateNode for CollectAssetsNode {
    fn name(&self) -> &str {
        "collect_assets"
    }

    async fn run(
        &self,
        ctx: &NodeContext,
        _state: &DebateState,
    ) -> Result<StateDelta, NodeError> {
        let incident = &ctx.incident;
        let mut interfaces: Vec<String> = Vec::new();
        let mut error_lines: Vec<String> = Vec::new();
        for line in incident.log_content.lines() {
            for token in line.split_whitespace() {
                if token.starts_with('/') && token.len() > 1 && !interfaces.iter().any(|i| i == token)
                {
                    interfaces.push(token.to_string());
                    if interfaces.len() >= ASSET_MAX_INTERFACES {
                        break;
                    }
                }
            }
            let upper = line.to_uppercase();
            if (upper.contains("ERROR") || upper.contains("FATAL")) && error_lines.len() < 8 {
                error_lines.push(line.trim().chars().take(220).collect());
            }
        }

        let interface_count = interfaces.len();
        let error_line_count = error_lines.len();
        let mapping = json!({
            "service": incident.service,
            "environment": incident.environment,
            "interfaces": interfaces,
            "error_lines": error_lines,
        });
        info!(
            session_id = %ctx.session_id,
            interfaces = interface_count,
            "asset mapping collected"
        );
        ctx.dispatcher
            .emit_kind(
                self.name(),
                DebatePhase::AssetMapping,
                None,
                EventKind::AssetInterfaceMappingCompleted { interface_count },
            )
            .await
            .map_err(|e| NodeError::Internal(e.to_string()))?;

        Ok(StateDelta::default()
            .with_context(context_keys::ASSET_MAPPING, mapping)
            .with_new_message(
                MessageRole::System,
                "system",
                DebatePhase::AssetMapping,
                &format!(
                    "asset mapping ready: {interface_count} interfaces, {error_line_count} error lines"
                ),
            ))
    }
}

// ── supervisor_decide ───────────────────────────────────────────────

/// Consults the supervisor router and issues the decided commands.
pub struct SupervisorDecideNode;

#[async_trait]
impl DebateNode for SupervisorDecideNode {
    fn name(&self) -> &str {
        "supervisor_decide"
    }

    async fn run(&self, ctx: &NodeContext, state: &DebateState) -> Result<StateDelta, NodeError> {
        let decision = match ctx.supervisor.decide(state, &ctx.cancel).await {
            Ok(decision) => decision,
            Err(SupervisorError::Cancelled) => return Err(NodeError::Cancelled),
            Err(error) => return Err(NodeError::Internal(error.to_string())),
        };
        debug!(
            session_id = %ctx.session_id,
            next_phase = %decision.next_phase,
            commands = decision.commands.len(),
            reason = %decision.reason,
            "supervisor decision"
        );

        let mut delta = StateDelta::default();
        for (agent, command) in &decision.commands {
            ctx.dispatcher
                .emit_kind(
                    self.name(),
                    decision.next_phase,
                    Some(agent),
                    EventKind::AgentCommandIssued {
                        target: agent.clone(),
                        round: command.issued_round,
                        task: command.task.clone(),
                        use_tool: command.use_tool,
                    },
                )
                .await
                .map_err(|e| NodeError::Internal(e.to_string()))?;
            delta.commands.insert(agent.clone(), command.clone());
        }

        // Supervisor note: one entry per routing decision.
        let mut notes = state
            .context
            .get(context_keys::SUPERVISOR_NOTES)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        notes.push(json!({
            "round": decision.round,
            "phase": decision.next_phase.as_str(),
            "reason": decision.reason,
        }));

        delta = delta
            .with_context(context_keys::SUPERVISOR_NOTES, Value::Array(notes))
            .with_new_message(
                MessageRole::Supervisor,
                "Supervisor",
                decision.next_phase,
                &decision.reason,
            )
            .with_route(RouteState {
                current_phase: decision.next_phase,
                next_node: None,
                loop_round: decision.round,
            });
        Ok(delta)
    }
}

// ── fan-out shell shared by aggregate / specialist / judge / verify ──

/// Run a fan-out over `targets`, merge deltas in settlement order, emit the
/// per-agent chat/round events, and extend the accumulated summary.
async fn run_fanout(
    ctx: &NodeContext,
    state: &DebateState,
    node_name: &str,
    targets: &[String],
) -> Result<StateDelta, NodeError> {
    let phase = state.route.current_phase;
    let snapshot = Arc::new(state.clone());
    let settled = match ctx.phases.run_phase(targets, snapshot, &ctx.cancel).await {
        Ok(settled) => settled,
        Err(PhaseError::Cancelled { settled }) => {
            // The fan-out is abandoned (its deltas never reach the state),
            // but agents that had already settled still reach the event
            // log before the session closes.
            for agent in &settled {
                emit_settled(ctx, node_name, phase, agent).await?;
            }
            return Err(NodeError::Cancelled);
        }
    };

    let mut merged = StateDelta::default();
    let mut summary_lines: Vec<String> = Vec::new();
    let mut max_elapsed = 0u64;
    for agent in &settled {
        max_elapsed = max_elapsed.max(agent.elapsed_ms);
        emit_settled(ctx, node_name, phase, agent).await?;
        if let Some(delta) = &agent.delta {
            if let Some(feedback) = delta.feedback.get(&agent.agent) {
                summary_lines.push(format!(
                    "{} [{}] {:.2}: {}",
                    agent.agent,
                    feedback.status,
                    feedback.confidence,
                    feedback.summary.chars().take(160).collect::<String>()
                ));
            }
        }
    }
    for agent in settled {
        if let Some(delta) = agent.delta {
            merged.merge(delta);
        }
    }

    // Rolling condensed summary fed to later prompts.
    if !summary_lines.is_empty() {
        let mut accumulated = state
            .context
            .get(context_keys::ACCUMULATED_SUMMARY)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        for line in summary_lines {
            accumulated.push_str(&line);
            accumulated.push('\n');
        }
        merged
            .context
            .insert(context_keys::ACCUMULATED_SUMMARY.to_string(), Value::String(accumulated));
    }
    *merged
        .metrics
        .phase_latencies_ms
        .entry(phase.as_str().to_string())
        .or_insert(0) += max_elapsed;
    Ok(merged)
}

async fn emit_settled(
    ctx: &NodeContext,
    node_name: &str,
    phase: DebatePhase,
    agent: &SettledAgent,
) -> Result<(), NodeError> {
    let Some(delta) = &agent.delta else {
        return Ok(());
    };
    for message in &delta.messages {
        ctx.dispatcher
            .emit_kind(
                node_name,
                phase,
                Some(&agent.agent),
                EventKind::AgentChatMessage {
                    message_id: message.id.clone(),
                    role: message.role.to_string(),
                    content: message.content.clone(),
                },
            )
            .await
            .map_err(|e| NodeError::Internal(e.to_string()))?;
    }
    if let Some(feedback) = delta.feedback.get(&agent.agent) {
        ctx.dispatcher
            .emit_kind(
                node_name,
                phase,
                Some(&agent.agent),
                EventKind::AgentRound {
                    round: feedback.round,
                    status: feedback.status.to_string(),
                    conclusion: feedback.summary.clone(),
                    confidence: feedback.confidence,
                    evidence_count: feedback.evidence_refs.len(),
                },
            )
            .await
            .map_err(|e| NodeError::Internal(e.to_string()))?;
    }
    Ok(())
}

/// Parallel fan-out over every agent still pending in the current round.
pub struct AggregateNode;

#[async_trait]
impl DebateNode for AggregateNode {
    fn name(&self) -> &str {
        "aggregate"
    }

    async fn run(&self, ctx: &NodeContext, state: &DebateState) -> Result<StateDelta, NodeError> {
        let targets = state.pending_agents(state.route.loop_round);
        if targets.is_empty() {
            return Ok(StateDelta::default());
        }
        run_fanout(ctx, state, self.name(), &targets).await
    }
}

/// Dedicated single-agent node; used when exactly one agent is pending.
pub struct SpecialistNode {
    agent: String,
    node_name: String,
}

impl SpecialistNode {
    pub fn new(agent: &str) -> Self {
        Self {
            agent: agent.to_string(),
            node_name: agent_node_name(agent),
        }
    }
}

#[async_trait]
impl DebateNode for SpecialistNode {
    fn name(&self) -> &str {
        &self.node_name
    }

    async fn run(&self, ctx: &NodeContext, state: &DebateState) -> Result<StateDelta, NodeError> {
        run_fanout(ctx, state, &self.node_name, &[self.agent.clone()]).await
    }
}

// ── judge ───────────────────────────────────────────────────────────

/// Runs the judge and materializes the final result from its adjudication.
pub struct JudgeNode;

impl JudgeNode {
    /// Build the final result from the judge's structured output against
    /// the evidence available in the state and the judge's own delta.
    fn final_result_from_output(
        output: &Value,
        state: &DebateState,
        judge_delta: &StateDelta,
        fallback_summary: &str,
    ) -> Option<FinalResult> {
        let judgment = output.get("final_judgment")?;

        let root_cause = match judgment.get("root_cause") {
            Some(Value::String(summary)) => summary.clone(),
            Some(Value::Object(object)) => object
                .get("summary")
                .and_then(Value::as_str)
                .unwrap_or(fallback_summary)
                .to_string(),
            _ => fallback_summary.to_string(),
        };
        let confidence = output
            .get("confidence")
            .and_then(Value::as_f64)
            .or_else(|| {
                judgment
                    .get("root_cause")
                    .and_then(|rc| rc.get("confidence"))
                    .and_then(Value::as_f64)
            })
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);

        // Cited ids, restricted to evidence that actually exists.
        let known = |id: &str| {
            state.has_evidence(id)
                || judge_delta.evidence.iter().any(|e| e.evidence_id == id)
        };
        let mut chain: Vec<String> = Vec::new();
        if let Some(cited) = judgment.get("evidence_chain").and_then(Value::as_array) {
            for id in cited.iter().filter_map(Value::as_str) {
                if known(id) && !chain.iter().any(|seen| seen == id) {
                    chain.push(id.to_string());
                }
            }
        }

        // The judge may cite loosely; backfill from the strongest evidence
        // per source kind until the two-kind floor is met.
        let kinds_cited = state.distinct_source_kinds(&chain).len();
        if chain.len() < 2 || kinds_cited < 2 {
            for item in &state.evidence {
                if chain.iter().any(|id| id == &item.evidence_id) {
                    continue;
                }
                chain.push(item.evidence_id.clone());
                let kinds = state.distinct_source_kinds(&chain);
                if chain.len() >= 2 && kinds.len() >= 2 {
                    break;
                }
            }
        }
        if chain.len() < 2 || state.distinct_source_kinds(&chain).len() < 2 {
            return None;
        }

        let impact = judgment
            .get("impact_analysis")
            .and_then(|i| i.get("business_impact"))
            .and_then(Value::as_str)
            .unwrap_or("impact pending assessment")
            .to_string();
        let fix = judgment
            .get("fix_recommendation")
            .map(|f| match f {
                Value::String(text) => text.clone(),
                other => other
                    .get("summary")
                    .and_then(Value::as_str)
                    .unwrap_or("mitigate first, then patch")
                    .to_string(),
            })
            .unwrap_or_else(|| "mitigate first, then patch".to_string());
        let verification_plan = judgment
            .get("verification_plan")
            .and_then(Value::as_str)
            .unwrap_or("re-run the failing flow and watch the cited signals")
            .to_string();
        let risk_level = judgment
            .get("risk_assessment")
            .and_then(|r| r.get("risk_level"))
            .and_then(Value::as_str)
            .map(RiskLevel::parse)
            .unwrap_or(RiskLevel::Medium);

        Some(FinalResult {
            root_cause,
            confidence,
            evidence_chain: chain,
            impact,
            fix_recommendation: fix,
            verification_plan,
            risk_level,
        })
    }

    /// Best prior specialist conclusion, used when the judge's own summary
    /// is missing entirely.
    fn fallback_summary(state: &DebateState) -> String {
        state
            .feedback
            .iter()
            .filter(|(name, _)| name.as_str() != "JudgeAgent")
            .filter(|(_, fb)| fb.status == crate::state::FeedbackStatus::Ok)
            .max_by(|a, b| {
                a.1.confidence
                    .partial_cmp(&b.1.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(_, fb)| fb.summary.clone())
            .unwrap_or_else(|| "需要进一步分析".to_string())
    }
}

#[async_trait]
impl DebateNode for JudgeNode {
    fn name(&self) -> &str {
        "judge"
    }

    async fn run(&self, ctx: &NodeContext, state: &DebateState) -> Result<StateDelta, NodeError> {
        let round = state.route.loop_round;

        // Ensure the judge holds a command; a supervisor stop can reach
        // judgment without issuing one.
        let mut working = state.clone();
        let mut command_delta = StateDelta::default();
        let has_command = working
            .commands
            .get("JudgeAgent")
            .map(|command| command.issued_round >= round)
            .unwrap_or(false);
        if !has_command {
            let command = AgentCommand {
                issued_round: round,
                task: "adjudicate the debate into a single evidenced root cause".to_string(),
                focus: "all findings, challenges, and rebuttals".to_string(),
                expected_output_schema_id: "judge_v1".to_string(),
                use_tool: ToolUse::Forbidden,
                tool_targets: Default::default(),
                deadline_ms: ctx.config.phase_timeout_ms(DebatePhase::Judgment),
            };
            working.commands.insert("JudgeAgent".to_string(), command.clone());
            command_delta.commands.insert("JudgeAgent".to_string(), command);
        }

        let mut delta = run_fanout(ctx, &working, self.name(), &["JudgeAgent".to_string()]).await?;

        // final_result is set-once; a judge re-run after an adjudication
        // already landed only refreshes feedback and transcript.
        if state.final_result.is_none() {
            if let Some(output) = delta.agent_outputs.get("JudgeAgent").cloned() {
                let fallback = Self::fallback_summary(state);
                match Self::final_result_from_output(&output, state, &delta, &fallback) {
                    Some(result) => {
                        info!(
                            session_id = %ctx.session_id,
                            confidence = result.confidence,
                            "adjudication materialized"
                        );
                        delta.final_result = Some(result);
                    }
                    None => {
                        warn!(
                            session_id = %ctx.session_id,
                            "judge output could not satisfy the evidence floor; no adjudication"
                        );
                    }
                }
            }
        }

        delta.merge(command_delta);
        Ok(delta)
    }
}

// ── verify ──────────────────────────────────────────────────────────

/// Runs the verification agent against the adjudication.
pub struct VerifyNode;

#[async_trait]
impl DebateNode for VerifyNode {
    fn name(&self) -> &str {
        "verify"
    }

    async fn run(&self, ctx: &NodeContext, state: &DebateState) -> Result<StateDelta, NodeError> {
        let round = state.route.loop_round;
        let mut working = state.clone();
        let mut command_delta = StateDelta::default();
        let has_command = working
            .commands
            .get("VerificationAgent")
            .map(|command| command.issued_round >= round)
            .unwrap_or(false);
        if !has_command {
            let focus = state
                .final_result
                .as_ref()
                .map(|r| format!("adjudicated root cause: {}", r.root_cause))
                .unwrap_or_else(|| "the debate ended without an adjudication".to_string());
            let command = AgentCommand {
                issued_round: round,
                task: "verify the adjudication against its cited evidence".to_string(),
                focus,
                expected_output_schema_id: "verification_v1".to_string(),
                use_tool: ToolUse::Forbidden,
                tool_targets: Default::default(),
                deadline_ms: ctx.config.phase_timeout_ms(DebatePhase::Verification),
            };
            working
                .commands
                .insert("VerificationAgent".to_string(), command.clone());
            command_delta
                .commands
                .insert("VerificationAgent".to_string(), command);
        }

        let mut delta =
            run_fanout(ctx, &working, self.name(), &["VerificationAgent".to_string()]).await?;
        delta.merge(command_delta);
        Ok(delta)
    }
}

// ── report ──────────────────────────────────────────────────────────

/// Validates the adjudication and hands it to the report renderer.
pub struct ReportNode;

#[async_trait]
impl DebateNode for ReportNode {
    fn name(&self) -> &str {
        "report"
    }

    async fn run(&self, ctx: &NodeContext, state: &DebateState) -> Result<StateDelta, NodeError> {
        let result = match ctx.guard.validate(state) {
            Ok(result) => result.clone(),
            Err(crate::report::ReportError::NoValidConclusion { reason, retry_hint }) => {
                return Err(NodeError::NoValidConclusion { reason, retry_hint });
            }
            Err(error) => return Err(NodeError::Internal(error.to_string())),
        };

        let document = ctx
            .renderer
            .render(&result, state)
            .await
            .map_err(|e| NodeError::Internal(e.to_string()))?;

        ctx.dispatcher
            .emit_kind(
                self.name(),
                DebatePhase::Report,
                None,
                EventKind::ResultReady {
                    root_cause: result.root_cause.clone(),
                    confidence: result.confidence,
                    risk_level: result.risk_level,
                },
            )
            .await
            .map_err(|e| NodeError::Internal(e.to_string()))?;

        let document_value = serde_json::to_value(&document)
            .map_err(|e| NodeError::Internal(e.to_string()))?;
        Ok(StateDelta::default()
            .with_context(context_keys::REPORT_DOCUMENT, document_value)
            .with_route(RouteState {
                current_phase: DebatePhase::Terminal,
                next_node: None,
                loop_round: state.route.loop_round,
            }))
    }
}

// ── terminal ────────────────────────────────────────────────────────

/// Freezes the session; routing maps the pinned marker to `End`.
pub struct TerminalNode;

#[async_trait]
impl DebateNode for TerminalNode {
    fn name(&self) -> &str {
        "terminal"
    }

    async fn run(
        &self,
        _ctx: &NodeContext,
        state: &DebateState,
    ) -> Result<StateDelta, NodeError> {
        Ok(StateDelta::default().with_route(RouteState {
            current_phase: DebatePhase::Terminal,
            next_node: Some(TERMINAL_END_MARKER.to_string()),
            loop_round: state.route.loop_round,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_node_names() {
        assert_eq!(agent_node_name("LogAgent"), "agent_log_node");
        assert_eq!(agent_node_name("CriticAgent"), "agent_critic_node");
        assert_eq!(agent_node_name("VerificationAgent"), "agent_verification_node");
    }
}
