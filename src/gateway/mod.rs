//! LLM gateway — retry, per-attempt timeout, backoff with jitter, and
//! structured-output classification.
//!
//! The concrete HTTP client is a collaborator behind [`LLMClient`]; the
//! gateway owns attempt orchestration and emits paired
//! `llm_request_started`/`llm_request_completed|failed|timeout` events
//! sharing a stable request id. Timeouts and transport errors surface as
//! [`LLMOutcome`] degradations, never as exceptions, unless the retry
//! profile marks exhaustion fatal.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::events::{EventKind, SharedDispatcher};
use crate::session::CancelFlag;
use crate::state::DebatePhase;

/// Error type returned by [`LLMClient`] implementations.
#[derive(Debug, thiserror::Error)]
pub enum LLMClientError {
    #[error("request timed out")]
    Timeout,

    #[error("upstream returned status {status}: {message}")]
    Http { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}

/// Error type for gateway-level failures.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// All attempts exhausted and the profile marks exhaustion fatal.
    #[error("llm call exhausted {attempts} attempts: {reason}")]
    Exhausted { attempts: u32, reason: String },

    /// Cooperative cancellation observed between attempts.
    #[error("session cancelled")]
    Cancelled,
}

/// Role of a chat message sent to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One chat message in a completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A successful completion from the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    /// Raw model output text.
    pub text: String,
    /// Approximate prompt tokens consumed.
    pub prompt_tokens: u64,
    /// Approximate completion tokens produced.
    pub completion_tokens: u64,
}

/// The LLM collaborator consumed by the core. Implementations should honor
/// `timeout`, but the gateway additionally wraps every attempt in its own
/// timer, so a misbehaving client cannot stall a session.
#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn complete(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Result<Completion, LLMClientError>;
}

/// Retry behavior for one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryProfile {
    /// Attempts beyond the first.
    pub max_retries: u32,
    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: u64,
    /// Exponential backoff base in milliseconds.
    pub backoff_base_ms: u64,
    /// Whether to add random jitter to each backoff sleep.
    pub jitter: bool,
    /// When set, exhaustion raises [`GatewayError::Exhausted`] instead of
    /// yielding a degraded outcome.
    pub fatal_on_exhaust: bool,
}

impl RetryProfile {
    /// Analysis specialists: short timeout, up to 2 retries.
    pub fn analysis() -> Self {
        Self {
            max_retries: 2,
            timeout_ms: 60_000,
            backoff_base_ms: 500,
            jitter: true,
            fatal_on_exhaust: false,
        }
    }

    /// Judge and verification: long timeout, 1 retry.
    pub fn adjudication() -> Self {
        Self {
            max_retries: 1,
            timeout_ms: 180_000,
            backoff_base_ms: 1_000,
            jitter: true,
            fatal_on_exhaust: false,
        }
    }

    /// Supervisor: short timeout, 1 retry.
    pub fn supervisor() -> Self {
        Self {
            max_retries: 1,
            timeout_ms: 60_000,
            backoff_base_ms: 500,
            jitter: true,
            fatal_on_exhaust: false,
        }
    }

    /// Backoff before retry `attempt` (1-based), with optional jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.backoff_base_ms.saturating_mul(1u64 << attempt.min(6));
        let jitter = if self.jitter && exp > 0 {
            rand::thread_rng().gen_range(0..=exp / 2)
        } else {
            0
        };
        Duration::from_millis(exp + jitter)
    }
}

impl Default for RetryProfile {
    fn default() -> Self {
        Self::analysis()
    }
}

/// Terminal classification of one gateway call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LLMOutcomeStatus {
    /// The call produced text (and possibly schema-parsed output).
    Ok,
    /// Every attempt timed out.
    Timeout,
    /// Every attempt failed with a non-timeout error.
    Error { reason: String },
}

/// Result of one gateway call, spanning all attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMOutcome {
    /// Terminal classification.
    pub status: LLMOutcomeStatus,
    /// Model output text (empty unless Ok).
    pub text: String,
    /// Strict-JSON parse of the text, present only when the request named a
    /// schema and the text parsed cleanly; layered repair is the caller's.
    pub parsed: Option<serde_json::Value>,
    /// Wall-clock latency across all attempts, in milliseconds.
    pub latency_ms: u64,
    /// Total attempts made.
    pub attempts: u32,
    /// Approximate prompt tokens (last successful attempt).
    pub prompt_tokens: u64,
    /// Approximate completion tokens (last successful attempt).
    pub completion_tokens: u64,
}

impl LLMOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self.status, LLMOutcomeStatus::Ok)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.status, LLMOutcomeStatus::Timeout)
    }
}

/// One gateway request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Target model.
    pub model_id: String,
    /// Agent this call serves (event attribution).
    pub agent_name: String,
    /// Phase the call was made in (event attribution).
    pub phase: DebatePhase,
    /// Chat messages forming the prompt.
    pub messages: Vec<ChatMessage>,
    /// Expected output schema id, if structured output is wanted.
    pub expected_schema_id: Option<String>,
    /// Overall deadline for this call; caps the per-attempt timeout.
    pub deadline_ms: u64,
    /// Retry behavior.
    pub profile: RetryProfile,
}

/// The gateway. Stateless across calls apart from its collaborator handles.
pub struct LlmGateway {
    client: Arc<dyn LLMClient>,
    dispatcher: SharedDispatcher,
}

impl LlmGateway {
    pub fn new(client: Arc<dyn LLMClient>, dispatcher: SharedDispatcher) -> Self {
        Self { client, dispatcher }
    }

    /// Execute one call with retries. Returns `Ok(outcome)` for every
    /// transient failure mode; `Err` only for fatal exhaustion or
    /// cancellation.
    pub async fn call(
        &self,
        request: LlmRequest,
        cancel: &CancelFlag,
    ) -> Result<LLMOutcome, GatewayError> {
        let request_id = format!("req_{}", uuid::Uuid::new_v4().simple());
        let started = Instant::now();
        let attempt_timeout =
            Duration::from_millis(request.profile.timeout_ms.min(request.deadline_ms.max(1)));
        let max_attempts = request.profile.max_retries + 1;

        let mut last_error: Option<LLMClientError> = None;
        let mut timed_out_attempts = 0u32;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }

            self.emit(
                &request,
                EventKind::LlmRequestStarted {
                    request_id: request_id.clone(),
                    model_id: request.model_id.clone(),
                    attempt,
                },
            )
            .await;

            let attempt_started = Instant::now();
            let result = tokio::time::timeout(
                attempt_timeout,
                self.client
                    .complete(&request.model_id, &request.messages, attempt_timeout),
            )
            .await;
            let attempt_latency = attempt_started.elapsed().as_millis() as u64;

            match result {
                Ok(Ok(completion)) => {
                    self.emit(
                        &request,
                        EventKind::LlmRequestCompleted {
                            request_id: request_id.clone(),
                            model_id: request.model_id.clone(),
                            latency_ms: attempt_latency,
                            prompt_tokens: completion.prompt_tokens,
                            completion_tokens: completion.completion_tokens,
                        },
                    )
                    .await;

                    let parsed = request
                        .expected_schema_id
                        .as_ref()
                        .and_then(|_| serde_json::from_str(completion.text.trim()).ok());
                    return Ok(LLMOutcome {
                        status: LLMOutcomeStatus::Ok,
                        text: completion.text,
                        parsed,
                        latency_ms: started.elapsed().as_millis() as u64,
                        attempts: attempt,
                        prompt_tokens: completion.prompt_tokens,
                        completion_tokens: completion.completion_tokens,
                    });
                }
                Ok(Err(LLMClientError::Timeout)) | Err(_) => {
                    timed_out_attempts += 1;
                    self.emit(
                        &request,
                        EventKind::LlmRequestTimeout {
                            request_id: request_id.clone(),
                            model_id: request.model_id.clone(),
                            latency_ms: attempt_latency,
                            attempt,
                        },
                    )
                    .await;
                    warn!(
                        agent = %request.agent_name,
                        model = %request.model_id,
                        attempt,
                        "llm attempt timed out"
                    );
                    last_error = Some(LLMClientError::Timeout);
                }
                Ok(Err(error)) => {
                    self.emit(
                        &request,
                        EventKind::LlmRequestFailed {
                            request_id: request_id.clone(),
                            model_id: request.model_id.clone(),
                            latency_ms: attempt_latency,
                            reason: error.to_string(),
                        },
                    )
                    .await;
                    warn!(
                        agent = %request.agent_name,
                        model = %request.model_id,
                        attempt,
                        error = %error,
                        "llm attempt failed"
                    );
                    last_error = Some(error);
                }
            }

            if attempt < max_attempts {
                let backoff = request.profile.backoff(attempt);
                debug!(
                    agent = %request.agent_name,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "retrying llm call"
                );
                tokio::time::sleep(backoff).await;
            }
        }

        let total_latency = started.elapsed().as_millis() as u64;
        let timed_out = timed_out_attempts == max_attempts;
        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        if request.profile.fatal_on_exhaust {
            return Err(GatewayError::Exhausted {
                attempts: max_attempts,
                reason,
            });
        }

        Ok(LLMOutcome {
            status: if timed_out {
                LLMOutcomeStatus::Timeout
            } else {
                LLMOutcomeStatus::Error { reason }
            },
            text: String::new(),
            parsed: None,
            latency_ms: total_latency,
            attempts: max_attempts,
            prompt_tokens: 0,
            completion_tokens: 0,
        })
    }

    async fn emit(&self, request: &LlmRequest, kind: EventKind) {
        // Event emission must not fail the call; log and continue.
        if let Err(error) = self
            .dispatcher
            .emit_kind("llm_gateway", request.phase, Some(&request.agent_name), kind)
            .await
        {
            warn!(error = %error, "failed to emit llm event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventDispatcher;
    use crate::session::{MemorySessionStore, SharedSessionStore};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Deterministic stub: scripted per-call behaviors.
    struct StubClient {
        calls: AtomicU32,
        behavior: Behavior,
    }

    enum Behavior {
        Succeed(&'static str),
        SleepForever,
        FailThenSucceed(&'static str),
        AlwaysHttpError,
    }

    #[async_trait]
    impl LLMClient for StubClient {
        async fn complete(
            &self,
            _model_id: &str,
            _messages: &[ChatMessage],
            _timeout: Duration,
        ) -> Result<Completion, LLMClientError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Succeed(text) => Ok(Completion {
                    text: text.to_string(),
                    prompt_tokens: 10,
                    completion_tokens: 5,
                }),
                Behavior::SleepForever => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(LLMClientError::Timeout)
                }
                Behavior::FailThenSucceed(text) => {
                    if call == 0 {
                        Err(LLMClientError::Http {
                            status: 503,
                            message: "overloaded".to_string(),
                        })
                    } else {
                        Ok(Completion {
                            text: text.to_string(),
                            prompt_tokens: 10,
                            completion_tokens: 5,
                        })
                    }
                }
                Behavior::AlwaysHttpError => Err(LLMClientError::Http {
                    status: 500,
                    message: "boom".to_string(),
                }),
            }
        }
    }

    fn gateway_with(behavior: Behavior) -> (LlmGateway, SharedSessionStore) {
        let store: SharedSessionStore = Arc::new(MemorySessionStore::new());
        let dispatcher = EventDispatcher::new("sess-1", store.clone()).shared();
        let client = Arc::new(StubClient {
            calls: AtomicU32::new(0),
            behavior,
        });
        (LlmGateway::new(client, dispatcher), store)
    }

    fn request(profile: RetryProfile, deadline_ms: u64, schema: Option<&str>) -> LlmRequest {
        LlmRequest {
            model_id: "specialist-small".to_string(),
            agent_name: "LogAgent".to_string(),
            phase: DebatePhase::Analysis,
            messages: vec![ChatMessage::user("analyze")],
            expected_schema_id: schema.map(str::to_string),
            deadline_ms,
            profile,
        }
    }

    #[tokio::test]
    async fn test_success_with_schema_parse() {
        let (gateway, _) = gateway_with(Behavior::Succeed(r#"{"conclusion": "ok"}"#));
        let cancel = CancelFlag::new();
        let outcome = gateway
            .call(request(RetryProfile::analysis(), 60_000, Some("specialist_v1")), &cancel)
            .await
            .unwrap();
        assert!(outcome.is_ok());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.parsed.unwrap()["conclusion"], "ok");
    }

    #[tokio::test]
    async fn test_unparsable_text_keeps_raw() {
        let (gateway, _) = gateway_with(Behavior::Succeed("not json at all"));
        let cancel = CancelFlag::new();
        let outcome = gateway
            .call(request(RetryProfile::analysis(), 60_000, Some("specialist_v1")), &cancel)
            .await
            .unwrap();
        assert!(outcome.is_ok());
        assert!(outcome.parsed.is_none());
        assert_eq!(outcome.text, "not json at all");
    }

    #[tokio::test]
    async fn test_timeout_emits_paired_events_and_degrades() {
        let (gateway, store) = gateway_with(Behavior::SleepForever);
        let cancel = CancelFlag::new();
        let profile = RetryProfile {
            max_retries: 1,
            timeout_ms: 20,
            backoff_base_ms: 1,
            jitter: false,
            fatal_on_exhaust: false,
        };
        let outcome = gateway.call(request(profile, 50, None), &cancel).await.unwrap();
        assert!(outcome.is_timeout());
        assert_eq!(outcome.attempts, 2);

        let events = store.load_events_since("sess-1", None).await.unwrap();
        let started = events
            .iter()
            .filter(|e| e.type_name() == "llm_request_started")
            .count();
        let timeouts = events
            .iter()
            .filter(|e| e.type_name() == "llm_request_timeout")
            .count();
        assert_eq!(started, 2);
        assert_eq!(timeouts, 2);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let (gateway, store) = gateway_with(Behavior::FailThenSucceed("recovered"));
        let cancel = CancelFlag::new();
        let profile = RetryProfile {
            max_retries: 2,
            timeout_ms: 1_000,
            backoff_base_ms: 1,
            jitter: true,
            fatal_on_exhaust: false,
        };
        let outcome = gateway.call(request(profile, 5_000, None), &cancel).await.unwrap();
        assert!(outcome.is_ok());
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.text, "recovered");

        let events = store.load_events_since("sess-1", None).await.unwrap();
        assert!(events.iter().any(|e| e.type_name() == "llm_request_failed"));
        assert!(events
            .iter()
            .any(|e| e.type_name() == "llm_request_completed"));
    }

    #[tokio::test]
    async fn test_error_exhaustion_yields_error_outcome() {
        let (gateway, _) = gateway_with(Behavior::AlwaysHttpError);
        let cancel = CancelFlag::new();
        let profile = RetryProfile {
            max_retries: 1,
            timeout_ms: 1_000,
            backoff_base_ms: 1,
            jitter: false,
            fatal_on_exhaust: false,
        };
        let outcome = gateway.call(request(profile, 5_000, None), &cancel).await.unwrap();
        match outcome.status {
            LLMOutcomeStatus::Error { reason } => assert!(reason.contains("500")),
            other => panic!("expected error outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fatal_on_exhaust() {
        let (gateway, _) = gateway_with(Behavior::AlwaysHttpError);
        let cancel = CancelFlag::new();
        let profile = RetryProfile {
            max_retries: 0,
            timeout_ms: 1_000,
            backoff_base_ms: 1,
            jitter: false,
            fatal_on_exhaust: true,
        };
        let err = gateway.call(request(profile, 5_000, None), &cancel).await.unwrap_err();
        assert!(matches!(err, GatewayError::Exhausted { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_cancelled_before_attempt() {
        let (gateway, _) = gateway_with(Behavior::Succeed("never"));
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = gateway
            .call(request(RetryProfile::analysis(), 60_000, None), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Cancelled));
    }
}
