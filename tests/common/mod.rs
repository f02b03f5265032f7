//! Shared test support: a deterministic scripted LLM stub and session
//! wiring helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use incident_debate::report::MarkdownReportRenderer;
use incident_debate::{
    ChatMessage, Completion, DebateConfig, DebatePhase, Incident, IncidentSeverity, LLMClient,
    LLMClientError, SessionService, SessionStatus, SharedSessionStore, SupervisorMode,
    ToolRegistry,
};

/// One scripted response for an agent.
#[derive(Clone)]
pub struct AgentScript {
    pub text: String,
    pub delay_ms: u64,
}

/// Deterministic LLM stub. Scripts are keyed by agent name, recovered from
/// the "You are <name>." suffix the runner appends to system prompts.
pub struct StubLlm {
    scripts: Mutex<HashMap<String, AgentScript>>,
}

impl StubLlm {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
        }
    }

    pub fn set(&self, agent: &str, text: &str) {
        self.set_with_delay(agent, text, 0);
    }

    pub fn set_with_delay(&self, agent: &str, text: &str, delay_ms: u64) {
        self.scripts.lock().unwrap().insert(
            agent.to_string(),
            AgentScript {
                text: text.to_string(),
                delay_ms,
            },
        );
    }

    fn agent_of(messages: &[ChatMessage]) -> String {
        let system = messages
            .first()
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        if system.contains("You coordinate an incident debate") {
            return "Supervisor".to_string();
        }
        if let Some(index) = system.rfind("You are ") {
            let rest = &system[index + "You are ".len()..];
            return rest.trim_end_matches('.').trim().to_string();
        }
        "unknown".to_string()
    }
}

#[async_trait]
impl LLMClient for StubLlm {
    async fn complete(
        &self,
        _model_id: &str,
        messages: &[ChatMessage],
        _timeout: Duration,
    ) -> Result<Completion, LLMClientError> {
        let agent = Self::agent_of(messages);
        let script = self.scripts.lock().unwrap().get(&agent).cloned();
        let script = script.unwrap_or(AgentScript {
            text: r#"{"chat_message": "no finding", "analysis": "none", "conclusion": "no finding", "confidence": 0.7, "evidence_chain": [], "missing_info": [], "open_questions": []}"#.to_string(),
            delay_ms: 0,
        });
        if script.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(script.delay_ms)).await;
        }
        Ok(Completion {
            text: script.text,
            prompt_tokens: 120,
            completion_tokens: 40,
        })
    }
}

/// Specialist response citing one evidence item.
pub fn specialist_text(
    kind: &str,
    source: &str,
    description: &str,
    conclusion: &str,
    confidence: f64,
) -> String {
    serde_json::json!({
        "chat_message": format!("My finding: {conclusion}"),
        "analysis": description,
        "conclusion": conclusion,
        "confidence": confidence,
        "evidence_chain": [{
            "type": kind,
            "source": source,
            "description": description,
            "strength": "strong",
        }],
        "missing_info": [],
        "open_questions": [],
    })
    .to_string()
}

/// Specialist response that raises an open question (drives critique).
pub fn questioning_specialist_text(conclusion: &str, question: &str) -> String {
    serde_json::json!({
        "chat_message": format!("My finding: {conclusion}"),
        "analysis": conclusion,
        "conclusion": conclusion,
        "confidence": 0.8,
        "evidence_chain": [{
            "type": "code",
            "source": "svc/checkout/pool.rs:88",
            "description": "pool size hardcoded to 10",
            "strength": "medium",
        }],
        "missing_info": [],
        "open_questions": [question],
    })
    .to_string()
}

/// Critic response challenging one agent.
pub fn critic_text(challenged_agent: &str) -> String {
    serde_json::json!({
        "chat_message": "I challenge a weak claim",
        "analysis": "one claim lacks corroborating signal",
        "conclusion": format!("{challenged_agent}'s claim needs defense"),
        "confidence": 0.8,
        "challenges": [{
            "agent": challenged_agent,
            "claim": "primary conclusion",
            "reason": "no corroborating metric",
        }],
        "open_questions": [],
        "evidence_chain": [],
        "missing_info": [],
    })
    .to_string()
}

/// Judge response; the evidence chain is left for the judge node to
/// backfill from the strongest state evidence.
pub fn judge_text(root_cause: &str, confidence: f64) -> String {
    serde_json::json!({
        "chat_message": format!("Adjudicated: {root_cause}"),
        "confidence": confidence,
        "final_judgment": {
            "root_cause": {
                "summary": root_cause,
                "category": "capacity",
                "confidence": confidence,
            },
            "evidence_chain": [],
            "impact_analysis": {"business_impact": "checkout conversions degraded"},
            "fix_recommendation": {"summary": "raise the pool ceiling and add backpressure"},
            "verification_plan": "replay the traffic spike in staging and watch pool saturation",
            "risk_assessment": {"risk_level": "high"},
        },
    })
    .to_string()
}

pub fn verification_text() -> String {
    serde_json::json!({
        "chat_message": "Adjudication verified",
        "analysis": "evidence supports the root cause",
        "conclusion": "verified",
        "confidence": 0.9,
        "gaps": [],
        "verified": true,
        "evidence_chain": [],
        "missing_info": [],
        "open_questions": [],
    })
    .to_string()
}

/// Script a clean six-specialist debate through judgment and verification.
pub fn script_happy_path(stub: &StubLlm) {
    stub.set(
        "LogAgent",
        &specialist_text(
            "log",
            "checkout/app.log:4412",
            "burst of pool-exhausted errors at 14:02",
            "connection pool exhausted",
            0.85,
        ),
    );
    stub.set(
        "CodeAgent",
        &specialist_text(
            "code",
            "svc/checkout/pool.rs:88",
            "pool size hardcoded to 10",
            "undersized pool",
            0.8,
        ),
    );
    stub.set(
        "DomainAgent",
        &specialist_text(
            "domain",
            "orders-flow.xlsx#sheet2",
            "checkout depends on the payments pool",
            "payments dependency saturated",
            0.75,
        ),
    );
    stub.set(
        "MetricsAgent",
        &specialist_text(
            "metric",
            "grafana:pool_in_use",
            "pool_in_use pegged at 10/10 during incident",
            "pool saturation confirmed",
            0.9,
        ),
    );
    stub.set(
        "ChangeAgent",
        &specialist_text(
            "change",
            "deploy:2024-06-01T13:55",
            "traffic-shaping change deployed 7 minutes before onset",
            "recent deploy correlated",
            0.7,
        ),
    );
    stub.set(
        "RunbookAgent",
        &specialist_text(
            "runbook",
            "case:INC-2211",
            "identical signature resolved by pool resize",
            "known failure signature",
            0.8,
        ),
    );
    stub.set(
        "JudgeAgent",
        &judge_text("connection pool exhausted under post-deploy retry storm", 0.86),
    );
    stub.set("VerificationAgent", &verification_text());
}

pub fn incident() -> Incident {
    Incident {
        id: "inc-2024-0601".to_string(),
        title: "Checkout latency spike".to_string(),
        description: "p99 latency on checkout rose from 200ms to 9s".to_string(),
        severity: IncidentSeverity::Critical,
        service: "checkout".to_string(),
        environment: "production".to_string(),
        log_content: "14:02:11 ERROR /api/checkout pool exhausted\n\
                      14:02:12 ERROR /api/checkout pool exhausted\n\
                      14:02:13 WARN /api/payments retry scheduled\n"
            .to_string(),
    }
}

/// Fast test configuration: rule supervisor, tight phase budgets.
pub fn fast_config() -> DebateConfig {
    let mut config = DebateConfig::default();
    config.supervisor_mode = SupervisorMode::Rule;
    for timeout in config.per_phase_timeout_ms.values_mut() {
        *timeout = 2_000;
    }
    config
}

/// Same as [`fast_config`], with a tiny analysis deadline to force
/// timeouts against a slow stub.
pub fn tight_analysis_config(analysis_deadline_ms: u64) -> DebateConfig {
    let mut config = fast_config();
    config
        .per_phase_timeout_ms
        .insert(DebatePhase::Analysis, analysis_deadline_ms);
    config
}

pub fn service_over(
    stub: Arc<StubLlm>,
    store: SharedSessionStore,
) -> SessionService {
    SessionService::new(
        store,
        stub,
        Arc::new(ToolRegistry::new()),
        Arc::new(MarkdownReportRenderer),
    )
}

/// Poll until the session reaches a terminal status (10s guard).
pub async fn wait_terminal(service: &SessionService, session_id: &str) -> SessionStatus {
    for _ in 0..500 {
        let status = service.status(session_id).await.unwrap();
        if status.is_terminal() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session {session_id} did not reach a terminal status");
}
