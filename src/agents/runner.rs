//! The agent runner — one polymorphic execution path over an agent
//! descriptor: prompt construction, tool gating, the LLM call, layered
//! parsing, evidence extraction, and feedback composition.
//!
//! Failure mapping: configuration problems (unknown agent, missing command)
//! yield `status=failed` feedback; gateway exhaustion and unparsable output
//! yield `status=degraded` with the raw text preserved. The session never
//! fails because one agent round went wrong; only cancellation propagates
//! out as an error.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{
    parse_judge_payload, parse_structured_output, schema_instruction, system_prompt,
    AgentRegistry, AgentRole, ParsedOutput,
};
use crate::config::DebateConfig;
use crate::events::{EventKind, SharedDispatcher};
use crate::gateway::{ChatMessage, GatewayError, LlmGateway, LlmRequest};
use crate::session::CancelFlag;
use crate::state::{
    context_keys, AgentCommand, AgentFeedback, DebateMessage, DebatePhase, DebateState,
    Evidence, EvidenceStrength, FeedbackStatus, MessageRole, SourceKind, StateDelta, ToolUse,
};
use crate::tools::ToolContextService;

/// Rolling transcript window injected into each prompt.
const RECENT_MESSAGE_WINDOW: usize = 6;
/// Approximate characters per token for the truncation budget.
const CHARS_PER_TOKEN: usize = 4;
/// Cap on evidence items extracted from one output.
const MAX_EVIDENCE_PER_ROUND: usize = 6;

/// Error type for the runner. Everything except cancellation is absorbed
/// into the produced delta.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("session cancelled")]
    Cancelled,
}

impl From<GatewayError> for RunnerError {
    fn from(error: GatewayError) -> Self {
        match error {
            GatewayError::Cancelled => Self::Cancelled,
            // fatal_on_exhaust is never set for agent calls.
            GatewayError::Exhausted { .. } => Self::Cancelled,
        }
    }
}

/// Executes specialist rounds against the LLM gateway and tool service.
pub struct AgentRunner {
    registry: Arc<AgentRegistry>,
    gateway: Arc<LlmGateway>,
    tools: Arc<ToolContextService>,
    config: Arc<DebateConfig>,
    dispatcher: SharedDispatcher,
}

impl AgentRunner {
    pub fn new(
        registry: Arc<AgentRegistry>,
        gateway: Arc<LlmGateway>,
        tools: Arc<ToolContextService>,
        config: Arc<DebateConfig>,
        dispatcher: SharedDispatcher,
    ) -> Self {
        Self {
            registry,
            gateway,
            tools,
            config,
            dispatcher,
        }
    }

    /// Execute one commanded round for `agent_name` against a state
    /// snapshot, returning the delta to merge. Within a parallel fan-out
    /// every runner sees the same snapshot, so no specialist observes
    /// another's output from the same round.
    pub async fn run(
        &self,
        agent_name: &str,
        state: Arc<DebateState>,
        cancel: &CancelFlag,
    ) -> Result<StateDelta, RunnerError> {
        let phase = state.route.current_phase;

        // Unknown agent or missing command is a configuration bug:
        // non-retryable, reported as failed feedback.
        let Some(descriptor) = self.registry.get(agent_name).cloned() else {
            warn!(agent = agent_name, "unknown agent commanded");
            return Ok(failed_delta(
                agent_name,
                state.route.loop_round,
                &format!("unknown agent {agent_name}"),
            ));
        };
        let Some(command) = state.commands.get(agent_name).cloned() else {
            warn!(agent = agent_name, "agent executed without a pending command");
            return Ok(failed_delta(
                agent_name,
                state.route.loop_round,
                &format!("no pending command for {agent_name}"),
            ));
        };
        let round = command.issued_round;

        // Tool gating before the LLM call.
        let mut tool_context = None;
        if command.use_tool != ToolUse::Forbidden {
            if command.use_tool == ToolUse::Required
                && self.tools.all_targets_unusable(agent_name, &command)
            {
                debug!(agent = agent_name, "required tools all unusable; degrading");
                let mut delta = StateDelta::default();
                delta.feedback.insert(
                    agent_name.to_string(),
                    AgentFeedback::degraded(
                        round,
                        "required tools unavailable; continuing without this input",
                    ),
                );
                return Ok(delta);
            }
            let params = json!({
                "focus": command.focus.clone(),
                "task": command.task.clone(),
                "service": state.context.get(context_keys::ASSET_MAPPING),
            });
            let context = self.tools.build_context(agent_name, &command, &params).await;
            for section in &context.sections {
                let _ = self
                    .dispatcher
                    .emit_kind(
                        "agent_runner",
                        phase,
                        Some(agent_name),
                        EventKind::AgentToolContextPrepared {
                            tool: section.tool,
                            status: section.status,
                            summary: section.summary.clone(),
                        },
                    )
                    .await;
                let _ = self
                    .dispatcher
                    .emit_kind(
                        "agent_runner",
                        phase,
                        Some(agent_name),
                        EventKind::AgentToolIo {
                            tool: section.tool,
                            action: "invoke".to_string(),
                            status: section.status,
                            outcome_summary: section.summary.clone(),
                        },
                    )
                    .await;
            }
            tool_context = Some(context);
        }
        if cancel.is_cancelled() {
            return Err(RunnerError::Cancelled);
        }

        // Prompt construction.
        let messages = build_prompt(
            &descriptor.role,
            &descriptor.output_schema_id,
            &state,
            agent_name,
            &command,
            tool_context
                .as_ref()
                .map(|c| c.render())
                .unwrap_or_default(),
            self.config.max_prompt_tokens,
        );

        // LLM call via the gateway.
        let outcome = self
            .gateway
            .call(
                LlmRequest {
                    model_id: descriptor.model_id.clone(),
                    agent_name: agent_name.to_string(),
                    phase,
                    messages,
                    expected_schema_id: Some(descriptor.output_schema_id.clone()),
                    deadline_ms: command.deadline_ms,
                    profile: descriptor.retry.clone(),
                },
                cancel,
            )
            .await?;
        if cancel.is_cancelled() {
            return Err(RunnerError::Cancelled);
        }

        let mut delta = StateDelta::default();
        delta.metrics.retry_counts = outcome.attempts.saturating_sub(1) as u64;
        delta.metrics.prompt_tokens = outcome.prompt_tokens;
        delta.metrics.completion_tokens = outcome.completion_tokens;

        if !outcome.is_ok() {
            if outcome.is_timeout() {
                delta.metrics.timeout_counts = 1;
            }
            let summary = if outcome.is_timeout() {
                "timeout, please continue without this input".to_string()
            } else {
                format!("llm call failed after {} attempts", outcome.attempts)
            };
            delta.feedback.insert(
                agent_name.to_string(),
                AgentFeedback::degraded(round, &summary),
            );
            return Ok(delta);
        }

        // Layered parse. The judge gets the recovery-oriented path.
        let parsed = if descriptor.role == AgentRole::Judge {
            let value = parse_judge_payload(&outcome.text);
            let structured_ok = value.contains_key("final_judgment");
            if structured_ok {
                ParsedOutput {
                    value,
                    structured_ok: true,
                }
            } else {
                parse_structured_output(&outcome.text)
            }
        } else {
            parse_structured_output(&outcome.text)
        };

        // Evidence extraction.
        let evidence = extract_evidence(&parsed.value, &descriptor.default_source_kind, agent_name);
        let evidence_refs: Vec<String> =
            evidence.iter().map(|e| e.evidence_id.clone()).collect();

        // Feedback composition.
        let feedback = compose_feedback(&parsed, round, &evidence_refs, &outcome.text);
        let chat_message = parsed
            .value
            .get("chat_message")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| clip(&outcome.text, 260));

        if !parsed.structured_ok {
            delta.metrics.unstructured_outputs = 1;
        }
        // Audit digest under a per-agent key: later rounds read it back
        // into this agent's prompt.
        if let Some(context) = &tool_context {
            if !context.audits.is_empty() {
                let digest: Vec<String> = context
                    .audits
                    .iter()
                    .map(|a| format!("[{}] {} {}", a.status, a.action, a.outcome_summary))
                    .collect();
                delta.context.insert(
                    format!("tool_audit::{agent_name}"),
                    Value::String(digest.join("\n")),
                );
            }
        }
        for item in evidence {
            delta.evidence.push(item);
        }
        delta.feedback.insert(agent_name.to_string(), feedback);
        delta.agent_outputs.insert(
            agent_name.to_string(),
            Value::Object(parsed.value.clone()),
        );
        delta.messages.push(DebateMessage::new(
            MessageRole::Specialist,
            agent_name,
            phase,
            &chat_message,
        ));
        Ok(delta)
    }
}

fn failed_delta(agent_name: &str, round: u32, summary: &str) -> StateDelta {
    let mut delta = StateDelta::default();
    delta
        .feedback
        .insert(agent_name.to_string(), AgentFeedback::failed(round, summary));
    delta
}

/// Build the chat messages for one agent call. The command and schema
/// sections are never truncated; transcript history is dropped oldest-first
/// when the approximate token budget is exceeded.
#[allow(clippy::too_many_arguments)]
fn build_prompt(
    role: &AgentRole,
    schema_id: &str,
    state: &DebateState,
    agent_name: &str,
    command: &AgentCommand,
    tool_context: String,
    max_prompt_tokens: usize,
) -> Vec<ChatMessage> {
    let mut fixed = String::new();
    if let Some(summary) = context_string(state, context_keys::INCIDENT_SUMMARY) {
        fixed.push_str(&format!("## Incident\n{summary}\n\n"));
    }
    if let Some(mapping) = state.context.get(context_keys::ASSET_MAPPING) {
        fixed.push_str(&format!("## Asset mapping\n{mapping}\n\n"));
    }
    if let Some(accumulated) = context_string(state, context_keys::ACCUMULATED_SUMMARY) {
        fixed.push_str(&format!("## Debate so far\n{accumulated}\n\n"));
    }
    if !tool_context.is_empty() {
        fixed.push_str(&format!("## Tool findings\n{tool_context}\n"));
    }
    if let Some(audit) = context_string(state, &format!("tool_audit::{agent_name}")) {
        fixed.push_str(&format!("## Prior tool activity\n{audit}\n\n"));
    }

    // Command and schema sections: never truncated.
    let command_section = format!(
        "## Your command (round {})\nTask: {}\nFocus: {}\n",
        command.issued_round, command.task, command.focus
    );
    let schema_section = schema_instruction(schema_id);

    // Rolling transcript restricted to this agent's phase and adjacent
    // phases, newest last.
    let phase = state.route.current_phase;
    let relevant: Vec<&DebateMessage> = state
        .messages
        .iter()
        .filter(|m| m.phase == phase || phase.adjacent().contains(&m.phase))
        .collect();
    let window: Vec<&DebateMessage> = relevant
        .iter()
        .rev()
        .take(RECENT_MESSAGE_WINDOW)
        .rev()
        .copied()
        .collect();

    let budget_chars = max_prompt_tokens.saturating_mul(CHARS_PER_TOKEN);
    let reserved = fixed.len() + command_section.len() + schema_section.len() + 200;
    let mut history = String::new();
    let mut used = 0usize;
    // Newest messages are kept preferentially; assemble from the tail.
    let mut kept: Vec<String> = Vec::new();
    for message in window.iter().rev() {
        let line = format!("[{}] {}: {}\n", message.phase, message.agent_name, message.content);
        if reserved + used + line.len() > budget_chars {
            break;
        }
        used += line.len();
        kept.push(line);
    }
    for line in kept.iter().rev() {
        history.push_str(line);
    }
    if !history.is_empty() {
        fixed.push_str(&format!("## Recent turns\n{history}\n"));
    }

    let user = format!("{fixed}{command_section}\n{schema_section}");
    vec![
        ChatMessage::system(format!(
            "{} You are {agent_name}.",
            system_prompt(*role)
        )),
        ChatMessage::user(user),
    ]
}

fn context_string<'a>(state: &'a DebateState, key: &str) -> Option<&'a str> {
    state.context.get(key).and_then(Value::as_str)
}

/// Extract evidence from the parsed output: items in `evidence_chain`
/// carrying a source reference are canonicalized and hashed; bare strings
/// (no citeable source) stay in the summary only.
fn extract_evidence(
    parsed: &serde_json::Map<String, Value>,
    default_kind: &SourceKind,
    agent_name: &str,
) -> Vec<Evidence> {
    let Some(chain) = parsed.get("evidence_chain").and_then(Value::as_array) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for item in chain.iter().take(MAX_EVIDENCE_PER_ROUND) {
        let Some(object) = item.as_object() else {
            continue;
        };
        let source = object
            .get("source")
            .or_else(|| object.get("location"))
            .or_else(|| object.get("ref"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim();
        if source.is_empty() {
            continue;
        }
        let description = object
            .get("description")
            .or_else(|| object.get("evidence"))
            .or_else(|| object.get("summary"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim();
        if description.is_empty() {
            continue;
        }
        let kind = object
            .get("type")
            .and_then(Value::as_str)
            .and_then(SourceKind::parse)
            .unwrap_or(*default_kind);
        let strength = object
            .get("strength")
            .and_then(Value::as_str)
            .map(EvidenceStrength::parse)
            .unwrap_or(EvidenceStrength::Medium);
        out.push(Evidence::new(kind, source, description, strength, agent_name));
    }
    out
}

fn compose_feedback(
    parsed: &ParsedOutput,
    round: u32,
    evidence_refs: &[String],
    raw_text: &str,
) -> AgentFeedback {
    let summary = parsed
        .value
        .get("conclusion")
        .or_else(|| parsed.value.get("analysis"))
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| clip(raw_text, 220));

    let confidence = parsed
        .value
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or_else(|| super::extract_confidence_hint(raw_text, 0.45))
        .clamp(0.0, 1.0);

    let status = if parsed.structured_ok {
        FeedbackStatus::Ok
    } else {
        FeedbackStatus::Degraded
    };

    AgentFeedback {
        round,
        status,
        summary,
        evidence_refs: evidence_refs.iter().cloned().collect(),
        confidence,
        missing_info: string_list(parsed.value.get("missing_info")),
        open_questions: string_list(parsed.value.get("open_questions")),
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .take(6)
            .collect(),
        Some(Value::String(item)) if !item.trim().is_empty() => {
            vec![item.trim().to_string()]
        }
        _ => Vec::new(),
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventDispatcher;
    use crate::gateway::{Completion, LLMClient, LLMClientError, RetryProfile};
    use crate::session::{MemorySessionStore, SharedSessionStore};
    use crate::tools::{ToolContextService, ToolKind, ToolRegistry};
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::time::Duration;

    struct ScriptedClient {
        text: String,
        sleep_ms: u64,
    }

    #[async_trait]
    impl LLMClient for ScriptedClient {
        async fn complete(
            &self,
            _model_id: &str,
            _messages: &[ChatMessage],
            _timeout: Duration,
        ) -> Result<Completion, LLMClientError> {
            if self.sleep_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.sleep_ms)).await;
            }
            Ok(Completion {
                text: self.text.clone(),
                prompt_tokens: 100,
                completion_tokens: 40,
            })
        }
    }

    fn runner_with(text: &str, sleep_ms: u64) -> (AgentRunner, SharedSessionStore) {
        let store: SharedSessionStore = Arc::new(MemorySessionStore::new());
        let dispatcher = EventDispatcher::new("sess-1", store.clone()).shared();
        let client = Arc::new(ScriptedClient {
            text: text.to_string(),
            sleep_ms,
        });
        let gateway = Arc::new(LlmGateway::new(client, dispatcher.clone()));
        let config = Arc::new(DebateConfig::default());
        let registry = ToolRegistry::new();
        let tools = Arc::new(ToolContextService::new(
            Arc::new(registry),
            config.tools_enabled.clone(),
            ToolContextService::default_allow_lists(),
        ));
        let runner = AgentRunner::new(
            Arc::new(AgentRegistry::standard()),
            gateway,
            tools,
            config,
            dispatcher,
        );
        (runner, store)
    }

    fn commanded_state(agent: &str, deadline_ms: u64, use_tool: ToolUse) -> Arc<DebateState> {
        let mut state = DebateState::default();
        state.route.current_phase = DebatePhase::Analysis;
        state.route.loop_round = 1;
        state.commands.insert(
            agent.to_string(),
            AgentCommand {
                issued_round: 1,
                task: "analyze the incident".into(),
                focus: "timeouts".into(),
                expected_output_schema_id: "specialist_v1".into(),
                use_tool,
                tool_targets: BTreeSet::new(),
                deadline_ms,
            },
        );
        Arc::new(state)
    }

    #[tokio::test]
    async fn test_structured_round_produces_full_delta() {
        let output = r#"{
            "chat_message": "Connection pool looks exhausted",
            "analysis": "saw repeated pool exhaustion",
            "conclusion": "pool exhausted",
            "confidence": 0.82,
            "evidence_chain": [
                {"type": "log", "source": "app.log:4412", "description": "pool exhausted errors", "strength": "strong"}
            ],
            "missing_info": [],
            "open_questions": []
        }"#;
        let (runner, _) = runner_with(output, 0);
        let cancel = CancelFlag::new();
        let state = commanded_state("LogAgent", 60_000, ToolUse::Forbidden);

        let delta = runner.run("LogAgent", state, &cancel).await.unwrap();
        let feedback = &delta.feedback["LogAgent"];
        assert_eq!(feedback.status, FeedbackStatus::Ok);
        assert_eq!(feedback.round, 1);
        assert!((feedback.confidence - 0.82).abs() < 1e-9);
        assert_eq!(delta.evidence.len(), 1);
        assert!(feedback
            .evidence_refs
            .contains(&delta.evidence[0].evidence_id));
        assert_eq!(delta.messages.len(), 1);
        assert_eq!(delta.messages[0].agent_name, "LogAgent");
        assert!(delta.agent_outputs.contains_key("LogAgent"));
    }

    #[tokio::test]
    async fn test_timeout_degrades_without_failing() {
        let (runner, store) = runner_with("{}", 500);
        let cancel = CancelFlag::new();
        let mut state = (*commanded_state("LogAgent", 50, ToolUse::Forbidden)).clone();
        // Tight deadline with a slow model: every attempt times out.
        if let Some(command) = state.commands.get_mut("LogAgent") {
            command.deadline_ms = 50;
        }
        // Shrink the retry profile through the descriptor default (analysis
        // profile caps attempts at 3; deadline caps each attempt at 50ms).
        let delta = runner.run("LogAgent", Arc::new(state), &cancel).await.unwrap();

        let feedback = &delta.feedback["LogAgent"];
        assert_eq!(feedback.status, FeedbackStatus::Degraded);
        assert!(feedback.summary.contains("timeout"));
        assert_eq!(delta.metrics.timeout_counts, 1);
        assert!(delta.messages.is_empty());

        let events = store.load_events_since("sess-1", None).await.unwrap();
        assert!(events.iter().any(|e| e.type_name() == "llm_request_timeout"));
    }

    #[tokio::test]
    async fn test_unparsable_output_degrades_with_raw_text() {
        let (runner, _) = runner_with("I could not produce JSON, sorry.", 0);
        let cancel = CancelFlag::new();
        let state = commanded_state("LogAgent", 60_000, ToolUse::Forbidden);

        let delta = runner.run("LogAgent", state, &cancel).await.unwrap();
        let feedback = &delta.feedback["LogAgent"];
        assert_eq!(feedback.status, FeedbackStatus::Degraded);
        assert_eq!(delta.metrics.unstructured_outputs, 1);
        // Raw text preserved as the chat message.
        assert_eq!(delta.messages[0].content, "I could not produce JSON, sorry.");
    }

    #[tokio::test]
    async fn test_unknown_agent_fails_feedback() {
        let (runner, _) = runner_with("{}", 0);
        let cancel = CancelFlag::new();
        let state = commanded_state("GhostAgent", 60_000, ToolUse::Forbidden);

        let delta = runner.run("GhostAgent", state, &cancel).await.unwrap();
        assert_eq!(delta.feedback["GhostAgent"].status, FeedbackStatus::Failed);
    }

    #[tokio::test]
    async fn test_missing_command_fails_feedback() {
        let (runner, _) = runner_with("{}", 0);
        let cancel = CancelFlag::new();
        let mut state = DebateState::default();
        state.route.current_phase = DebatePhase::Analysis;

        let delta = runner.run("LogAgent", Arc::new(state), &cancel).await.unwrap();
        assert_eq!(delta.feedback["LogAgent"].status, FeedbackStatus::Failed);
    }

    #[tokio::test]
    async fn test_required_tools_unusable_degrades_without_llm_call() {
        let (runner, store) = runner_with("{}", 0);
        let cancel = CancelFlag::new();
        let mut state = (*commanded_state("LogAgent", 60_000, ToolUse::Required)).clone();
        if let Some(command) = state.commands.get_mut("LogAgent") {
            command.tool_targets = [ToolKind::LocalLogReader].into_iter().collect();
        }

        let delta = runner.run("LogAgent", Arc::new(state), &cancel).await.unwrap();
        let feedback = &delta.feedback["LogAgent"];
        assert_eq!(feedback.status, FeedbackStatus::Degraded);
        assert!(feedback.summary.contains("tools unavailable"));

        // No LLM request events: the call was skipped entirely.
        let events = store.load_events_since("sess-1", None).await.unwrap();
        assert!(!events.iter().any(|e| e.type_name().starts_with("llm_request")));
    }

    #[tokio::test]
    async fn test_cancelled_propagates() {
        let (runner, _) = runner_with("{}", 0);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let state = commanded_state("LogAgent", 60_000, ToolUse::Forbidden);
        let err = runner.run("LogAgent", state, &cancel).await.unwrap_err();
        assert!(matches!(err, RunnerError::Cancelled));
    }

    #[test]
    fn test_prompt_never_truncates_command_or_schema() {
        let mut state = DebateState::default();
        state.route.current_phase = DebatePhase::Analysis;
        state.context.insert(
            context_keys::INCIDENT_SUMMARY.to_string(),
            Value::String("checkout latency spike".to_string()),
        );
        for index in 0..40 {
            state.messages.push(DebateMessage::new(
                MessageRole::Specialist,
                "LogAgent",
                DebatePhase::Analysis,
                &format!("turn {index} {}", "x".repeat(400)),
            ));
        }
        let command = AgentCommand {
            issued_round: 2,
            task: "dig into the spike".into(),
            focus: "p99 latency".into(),
            expected_output_schema_id: "specialist_v1".into(),
            use_tool: ToolUse::Forbidden,
            tool_targets: BTreeSet::new(),
            deadline_ms: 60_000,
        };
        // Tiny budget: history must be dropped, command/schema must stay.
        let messages = build_prompt(
            &AgentRole::Specialist,
            "specialist_v1",
            &state,
            "LogAgent",
            &command,
            String::new(),
            200,
        );
        let user = &messages[1].content;
        assert!(user.contains("dig into the spike"));
        assert!(user.contains("evidence_chain"));
        assert!(!user.contains("turn 0 "));
    }

    #[test]
    fn test_evidence_extraction_skips_sourceless_claims() {
        let parsed: serde_json::Map<String, Value> = serde_json::from_str(
            r#"{"evidence_chain": [
                {"type": "log", "source": "app.log:1", "description": "error burst"},
                {"type": "log", "description": "no source here"},
                "a bare string claim"
            ]}"#,
        )
        .unwrap();
        let evidence = extract_evidence(&parsed, &SourceKind::Log, "LogAgent");
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].source_ref, "app.log:1");
    }

    #[test]
    fn test_retry_profile_defaults_via_descriptor() {
        let registry = AgentRegistry::standard();
        assert_eq!(
            registry.get("LogAgent").unwrap().retry,
            RetryProfile::analysis()
        );
    }
}
