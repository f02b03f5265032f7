//! Multi-agent debate runtime for SRE root-cause analysis.
//!
//! A coordinating supervisor drives a pool of specialist LLM-backed agents
//! (log, code, domain, metrics, change, runbook, critic, rebuttal, judge,
//! verification) through multi-round debate over an incident, emits a live
//! event stream, and produces a structured adjudication.
//!
//! # Architecture
//!
//! - [`state`]: typed debate state with commutative reducers
//! - [`graph`]: node registry, conditional routing, checkpointing executor
//! - [`phase`]: bounded parallel specialist fan-out with fan-in aggregation
//! - [`supervisor`]: rule-based + LLM-dynamic phase deciders
//! - [`agents`]: agent descriptors, prompt construction, layered output parsing
//! - [`tools`]: capability-gated, audited tool invocation
//! - [`gateway`]: LLM calls with retry, timeout, and degradation
//! - [`events`]: de-duplicated, schema-stable event stream
//! - [`session`]: lifecycle, cancellation, recovery, final result
//! - [`report`]: conclusion validity enforcement
//!
//! The concrete LLM HTTP client, tool I/O, persistent storage, and report
//! rendering are collaborator traits ([`gateway::LLMClient`],
//! [`tools::Tool`], [`session::SessionStore`], [`report::ReportRenderer`])
//! supplied by the embedding application.

pub mod agents;
pub mod config;
pub mod events;
pub mod gateway;
pub mod graph;
pub mod phase;
pub mod report;
pub mod session;
pub mod state;
pub mod supervisor;
pub mod tools;

// Re-export key state types
pub use state::{
    AgentCommand, AgentFeedback, DebateMessage, DebateMetrics, DebatePhase, DebateState,
    Evidence, EvidenceStrength, FeedbackStatus, FinalResult, Incident, IncidentSeverity,
    MessageRole, RiskLevel, RouteState, SessionStatus, SourceKind, StateDelta, StateError,
    ToolUse,
};

// Re-export key event types
pub use events::{DebateEvent, EventDispatcher, EventKind, EventSubscription, SharedDispatcher};

// Re-export gateway types
pub use gateway::{
    ChatMessage, ChatRole, Completion, LLMClient, LLMClientError, LLMOutcome, LLMOutcomeStatus,
    LlmGateway, RetryProfile,
};

// Re-export tool types
pub use tools::{
    AuditRecord, Tool, ToolContextService, ToolError, ToolKind, ToolRegistry, ToolResult,
    ToolStatus,
};

// Re-export agent types
pub use agents::{AgentDescriptor, AgentRegistry, AgentRole, AgentRunner, ParsedOutput};

// Re-export orchestration types
pub use graph::{DebateNode, GraphBuilder, GraphError, GraphExecutor, NextNode, NodeContext};
pub use phase::{PhaseExecutor, SettleOutcome, SettledAgent};
pub use supervisor::{RouteDecision, SupervisorMode, SupervisorRouter};

// Re-export session types
pub use session::{
    CancelFlag, Checkpoint, ControlAction, MemorySessionStore, SessionError, SessionService,
    SessionStore, SharedSessionStore,
};

// Re-export report types
pub use report::{ReportDocument, ReportError, ReportGuard, ReportRenderer};

// Re-export configuration
pub use config::{ConfigError, DebateConfig};
