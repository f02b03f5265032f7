//! Session lifecycle — create, start, subscribe, cancel, resume,
//! retry-failed, and final-result retrieval.
//!
//! Each running session owns one graph executor pumped on a background
//! task. Cancellation is a cooperative flag polled at every suspension
//! point; status transitions are strictly forward.

mod store;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use store::{Checkpoint, MemorySessionStore, SessionStore, SharedSessionStore, StoreError};

use crate::agents::{AgentRegistry, AgentRunner};
use crate::config::{ConfigError, DebateConfig};
use crate::events::{EventDispatcher, EventSubscription, SharedDispatcher};
use crate::gateway::{LLMClient, LlmGateway};
use crate::graph::{GraphBuilder, GraphExecutor, NodeContext};
use crate::phase::PhaseExecutor;
use crate::report::{ReportGuard, ReportRenderer};
use crate::state::{
    DebatePhase, DebateState, FeedbackStatus, FinalResult, Incident, SessionStatus,
};
use crate::supervisor::SupervisorRouter;
use crate::tools::{ToolContextService, ToolRegistry};

/// Cooperative cancellation flag shared across a session's suspension
/// points.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Control actions accepted by [`SessionService::send_control`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Cancel,
    Resume,
    RetryFailedOnly,
}

/// Error type for session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error("session {session_id} is {status}; {operation} not allowed")]
    InvalidStatus {
        session_id: String,
        status: SessionStatus,
        operation: &'static str,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("timed out waiting for final result")]
    Timeout,

    #[error("session failed with {error_code}")]
    Failed { error_code: String },

    #[error("no final result was produced")]
    NoResult,

    #[error("store error: {0}")]
    Store(String),
}

struct SessionHandle {
    session_id: String,
    incident: Incident,
    cancel: Mutex<CancelFlag>,
    dispatcher: SharedDispatcher,
    status_tx: watch::Sender<SessionStatus>,
    status_rx: watch::Receiver<SessionStatus>,
    result_tx: watch::Sender<Option<FinalResult>>,
    result_rx: watch::Receiver<Option<FinalResult>>,
    task: Mutex<Option<JoinHandle<()>>>,
    config: Mutex<Option<Arc<DebateConfig>>>,
}

impl SessionHandle {
    fn new(session_id: String, incident: Incident, dispatcher: SharedDispatcher) -> Self {
        let (status_tx, status_rx) = watch::channel(SessionStatus::Pending);
        let (result_tx, result_rx) = watch::channel(None);
        Self {
            session_id,
            incident,
            cancel: Mutex::new(CancelFlag::new()),
            dispatcher,
            status_tx,
            status_rx,
            result_tx,
            result_rx,
            task: Mutex::new(None),
            config: Mutex::new(None),
        }
    }

    fn status(&self) -> SessionStatus {
        *self.status_rx.borrow()
    }

    /// Forward-only status update; out-of-order sends are dropped.
    fn set_status(&self, next: SessionStatus) {
        let current = self.status();
        if current == next || current.can_transition_to(next) {
            let _ = self.status_tx.send(next);
        } else {
            warn!(
                session_id = %self.session_id,
                from = %current,
                to = %next,
                "ignored reverse status transition"
            );
        }
    }
}

/// The session service: the boundary the API/WS layer consumes.
pub struct SessionService {
    store: SharedSessionStore,
    client: Arc<dyn LLMClient>,
    tools: Arc<ToolRegistry>,
    renderer: Arc<dyn ReportRenderer>,
    registry: Arc<AgentRegistry>,
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
}

impl SessionService {
    pub fn new(
        store: SharedSessionStore,
        client: Arc<dyn LLMClient>,
        tools: Arc<ToolRegistry>,
        renderer: Arc<dyn ReportRenderer>,
    ) -> Self {
        Self {
            store,
            client,
            tools,
            renderer,
            registry: Arc::new(AgentRegistry::standard()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the agent roster (before any session starts).
    pub fn with_registry(mut self, registry: AgentRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Create a session bound to an incident; returns the session id.
    pub async fn create_session(&self, incident: Incident) -> String {
        let session_id = format!("sess_{}", uuid::Uuid::new_v4().simple());
        self.create_session_with_id(incident, &session_id).await;
        session_id
    }

    /// Create (or re-register after a restart) a session under a known id.
    /// Starting it later picks up any persisted checkpoint.
    pub async fn create_session_with_id(&self, incident: Incident, session_id: &str) {
        let dispatcher =
            EventDispatcher::new(session_id, self.store.clone()).shared();
        let handle = Arc::new(SessionHandle::new(
            session_id.to_string(),
            incident,
            dispatcher,
        ));
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), handle);
    }

    /// Start (or resume) a session: launch the graph executor as a
    /// background task. If a checkpoint exists, execution resumes from its
    /// snapshot; otherwise a fresh debate starts.
    pub async fn start_session(
        &self,
        session_id: &str,
        config: DebateConfig,
    ) -> Result<(), SessionError> {
        config.validate()?;
        let handle = self.handle(session_id).await?;

        let status = handle.status();
        if status.is_terminal() {
            return Err(SessionError::InvalidStatus {
                session_id: session_id.to_string(),
                status,
                operation: "start",
            });
        }
        {
            let task = handle.task.lock().await;
            if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
                return Err(SessionError::InvalidStatus {
                    session_id: session_id.to_string(),
                    status,
                    operation: "start (already running)",
                });
            }
        }

        // Recover the de-dup set and sequence so resumed sessions keep
        // producing stable, gap-free event ids.
        handle
            .dispatcher
            .recover()
            .await
            .map_err(|e| SessionError::Store(e.to_string()))?;

        let state = match self
            .store
            .load_checkpoint(session_id)
            .await
            .map_err(|e| SessionError::Store(e.to_string()))?
        {
            Some(checkpoint) if !checkpoint.status.is_terminal() => {
                info!(
                    session_id,
                    last_node = %checkpoint.last_node,
                    "resuming from checkpoint"
                );
                checkpoint.state
            }
            _ => DebateState::default(),
        };

        self.spawn_executor(handle, Arc::new(config), state).await;
        Ok(())
    }

    /// Subscribe to the session's event stream with an optional resume
    /// cursor (last `event_id` seen).
    pub async fn subscribe(
        &self,
        session_id: &str,
        resume_cursor: Option<&str>,
    ) -> Result<EventSubscription, SessionError> {
        let handle = self.handle(session_id).await?;
        handle
            .dispatcher
            .subscribe(resume_cursor)
            .await
            .map_err(|e| SessionError::Store(e.to_string()))
    }

    /// Apply a control action.
    pub async fn send_control(
        &self,
        session_id: &str,
        action: ControlAction,
    ) -> Result<(), SessionError> {
        match action {
            ControlAction::Cancel => self.cancel(session_id).await,
            ControlAction::Resume => self.resume(session_id).await,
            ControlAction::RetryFailedOnly => self.retry_failed_only(session_id).await,
        }
    }

    /// Current session status.
    pub async fn status(&self, session_id: &str) -> Result<SessionStatus, SessionError> {
        Ok(self.handle(session_id).await?.status())
    }

    /// Block up to `timeout` for the final result.
    pub async fn get_final_result(
        &self,
        session_id: &str,
        timeout: Option<Duration>,
    ) -> Result<FinalResult, SessionError> {
        let handle = self.handle(session_id).await?;
        let wait = self.wait_for_result(handle);
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait)
                .await
                .map_err(|_| SessionError::Timeout)?,
            None => wait.await,
        }
    }

    async fn wait_for_result(&self, handle: Arc<SessionHandle>) -> Result<FinalResult, SessionError> {
        let mut result_rx = handle.result_rx.clone();
        let mut status_rx = handle.status_rx.clone();
        loop {
            if let Some(result) = result_rx.borrow().clone() {
                return Ok(result);
            }
            let status = *status_rx.borrow();
            if status.is_terminal() {
                return match status {
                    SessionStatus::Completed => Err(SessionError::NoResult),
                    SessionStatus::Failed => Err(SessionError::Failed {
                        error_code: "see session_failed event".to_string(),
                    }),
                    _ => Err(SessionError::NoResult),
                };
            }
            tokio::select! {
                changed = result_rx.changed() => {
                    if changed.is_err() {
                        return Err(SessionError::NoResult);
                    }
                }
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        return Err(SessionError::NoResult);
                    }
                }
            }
        }
    }

    async fn cancel(&self, session_id: &str) -> Result<(), SessionError> {
        let handle = self.handle(session_id).await?;
        let status = handle.status();
        if status.is_terminal() {
            return Err(SessionError::InvalidStatus {
                session_id: session_id.to_string(),
                status,
                operation: "cancel",
            });
        }
        info!(session_id, "cancel requested");
        handle.cancel.lock().await.cancel();
        // A session that never started has no executor to observe the
        // flag; settle its status directly.
        if handle.task.lock().await.is_none() {
            handle.set_status(SessionStatus::Cancelled);
        }
        Ok(())
    }

    /// Resume an interrupted session from its last checkpoint. The running
    /// task must have stopped (process restart or earlier failure to
    /// schedule); a live session cannot be resumed into twice.
    async fn resume(&self, session_id: &str) -> Result<(), SessionError> {
        let handle = self.handle(session_id).await?;
        {
            let task = handle.task.lock().await;
            if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
                return Err(SessionError::InvalidStatus {
                    session_id: session_id.to_string(),
                    status: handle.status(),
                    operation: "resume (still running)",
                });
            }
        }
        let checkpoint = self
            .store
            .load_checkpoint(session_id)
            .await
            .map_err(|e| SessionError::Store(e.to_string()))?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        if checkpoint.status.is_terminal() {
            return Err(SessionError::InvalidStatus {
                session_id: session_id.to_string(),
                status: checkpoint.status,
                operation: "resume",
            });
        }
        handle
            .dispatcher
            .recover()
            .await
            .map_err(|e| SessionError::Store(e.to_string()))?;
        let config = handle
            .config
            .lock()
            .await
            .clone()
            .unwrap_or_else(|| Arc::new(DebateConfig::default()));
        self.spawn_executor(handle, config, checkpoint.state).await;
        Ok(())
    }

    /// Restart only agents whose last outcome was failed or degraded,
    /// preserving confirmed progress. Runs the session forward as a new
    /// execution epoch from the adjusted checkpoint.
    async fn retry_failed_only(&self, session_id: &str) -> Result<(), SessionError> {
        let handle = self.handle(session_id).await?;
        {
            let task = handle.task.lock().await;
            if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
                return Err(SessionError::InvalidStatus {
                    session_id: session_id.to_string(),
                    status: handle.status(),
                    operation: "retry_failed_only (still running)",
                });
            }
        }
        let checkpoint = self
            .store
            .load_checkpoint(session_id)
            .await
            .map_err(|e| SessionError::Store(e.to_string()))?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        let mut state = checkpoint.state;
        let mut retried: Vec<String> = state
            .feedback
            .iter()
            .filter(|(_, fb)| {
                matches!(fb.status, FeedbackStatus::Failed | FeedbackStatus::Degraded)
            })
            .map(|(name, _)| name.clone())
            .collect();

        // An adjudication the guard would reject counts as a failed judge
        // round: drop it so the judge re-runs.
        let config_snapshot = handle
            .config
            .lock()
            .await
            .clone()
            .unwrap_or_else(|| Arc::new(DebateConfig::default()));
        let guard = crate::report::ReportGuard::new(&config_snapshot);
        if state.final_result.is_some() && guard.validate(&state).is_err() {
            state.final_result = None;
            state.agent_outputs.remove("JudgeAgent");
            if !retried.iter().any(|name| name == "JudgeAgent") {
                retried.push("JudgeAgent".to_string());
            }
        }
        for agent in &retried {
            state.feedback.remove(agent);
        }
        // A missing adjudication re-enters judgment. Direct rollback is
        // allowed here: this is a fresh execution epoch built outside the
        // reducers, not a runtime phase transition.
        if state.final_result.is_none()
            && matches!(
                state.route.current_phase,
                DebatePhase::Verification | DebatePhase::Report | DebatePhase::Terminal
            )
        {
            state.route.current_phase = DebatePhase::Judgment;
            state.route.next_node = None;
        }
        info!(session_id, retried = retried.len(), "retrying failed agents");

        // Fresh execution epoch: reset the handle's lifecycle channels.
        let fresh = Arc::new(SessionHandle::new(
            session_id.to_string(),
            handle.incident.clone(),
            handle.dispatcher.clone(),
        ));
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), fresh.clone());
        fresh
            .dispatcher
            .recover()
            .await
            .map_err(|e| SessionError::Store(e.to_string()))?;
        self.spawn_executor(fresh, config_snapshot, state).await;
        Ok(())
    }

    async fn spawn_executor(
        &self,
        handle: Arc<SessionHandle>,
        config: Arc<DebateConfig>,
        state: DebateState,
    ) {
        // Fresh cancel flag per run; a stale flag from an earlier cancel
        // must not kill the new run.
        let cancel = CancelFlag::new();
        *handle.cancel.lock().await = cancel.clone();
        *handle.config.lock().await = Some(config.clone());
        handle.set_status(SessionStatus::Running);

        let dispatcher = handle.dispatcher.clone();
        let gateway = Arc::new(LlmGateway::new(self.client.clone(), dispatcher.clone()));
        let tool_service = Arc::new(ToolContextService::new(
            self.tools.clone(),
            config.tools_enabled.clone(),
            ToolContextService::default_allow_lists(),
        ));
        let runner = Arc::new(AgentRunner::new(
            self.registry.clone(),
            gateway.clone(),
            tool_service,
            config.clone(),
            dispatcher.clone(),
        ));
        let phases = Arc::new(PhaseExecutor::new(runner.clone(), config.concurrency_limit));
        let supervisor = Arc::new(SupervisorRouter::new(
            config.clone(),
            self.registry.clone(),
            gateway,
        ));
        let guard = Arc::new(ReportGuard::new(&config));

        let ctx = NodeContext {
            session_id: handle.session_id.clone(),
            incident: handle.incident.clone(),
            config: config.clone(),
            registry: self.registry.clone(),
            dispatcher,
            runner,
            phases,
            supervisor,
            guard,
            renderer: self.renderer.clone(),
            cancel,
        };
        let nodes = GraphBuilder::standard(&self.registry).build();
        let executor = GraphExecutor::new(ctx, nodes, self.store.clone());

        let task_handle = handle.clone();
        let task = tokio::spawn(async move {
            let outcome = executor.run(state).await;
            if outcome.status == SessionStatus::Completed {
                let _ = task_handle
                    .result_tx
                    .send(outcome.state.final_result.clone());
            }
            task_handle.set_status(outcome.status);
        });
        *handle.task.lock().await = Some(task);
    }

    async fn handle(&self, session_id: &str) -> Result<Arc<SessionHandle>, SessionError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }
}
