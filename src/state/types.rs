//! Core debate state types — phases, messages, evidence, the
//! supervisor↔specialist command/feedback protocol, and the shared state
//! container mutated through reducers.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::tools::ToolKind;

/// Phase of a debate session.
///
/// Phase order is monotone: init → asset_mapping → analysis →
/// (critique → rebuttal)* → judgment → verification → report → terminal.
/// Only the critique/rebuttal loop may repeat, bounded by `max_rounds`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DebatePhase {
    /// Session created, state seeded from the incident.
    Init,
    /// Service/interface mapping is being collected.
    AssetMapping,
    /// Specialists analyze the incident in parallel.
    Analysis,
    /// The critic challenges specialist claims.
    Critique,
    /// Challenged specialists respond with rebuttals.
    Rebuttal,
    /// The judge adjudicates and writes the final result.
    Judgment,
    /// The verification agent checks the adjudication.
    Verification,
    /// The report guard validates and hands off the conclusion.
    Report,
    /// Session finished; state is frozen.
    Terminal,
}

impl DebatePhase {
    /// Whether this is the terminal phase.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminal)
    }

    /// Valid successor phases.
    pub fn valid_transitions(self) -> &'static [DebatePhase] {
        match self {
            Self::Init => &[Self::AssetMapping],
            Self::AssetMapping => &[Self::Analysis],
            Self::Analysis => &[Self::Critique, Self::Judgment],
            Self::Critique => &[Self::Rebuttal],
            Self::Rebuttal => &[Self::Critique, Self::Judgment],
            Self::Judgment => &[Self::Verification],
            Self::Verification => &[Self::Report],
            Self::Report => &[Self::Terminal],
            Self::Terminal => &[],
        }
    }

    /// Whether a transition to `to` honors the monotone phase order.
    /// Staying in the current phase is always allowed.
    pub fn can_advance_to(self, to: DebatePhase) -> bool {
        self == to || self.valid_transitions().contains(&to)
    }

    /// Snake-case name, matching the wire format.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::AssetMapping => "asset_mapping",
            Self::Analysis => "analysis",
            Self::Critique => "critique",
            Self::Rebuttal => "rebuttal",
            Self::Judgment => "judgment",
            Self::Verification => "verification",
            Self::Report => "report",
            Self::Terminal => "terminal",
        }
    }

    /// Phases adjacent to this one (used for prompt context windowing).
    pub fn adjacent(self) -> &'static [DebatePhase] {
        match self {
            Self::Init => &[Self::AssetMapping],
            Self::AssetMapping => &[Self::Init, Self::Analysis],
            Self::Analysis => &[Self::AssetMapping, Self::Critique],
            Self::Critique => &[Self::Analysis, Self::Rebuttal],
            Self::Rebuttal => &[Self::Critique, Self::Judgment],
            Self::Judgment => &[Self::Rebuttal, Self::Verification],
            Self::Verification => &[Self::Judgment, Self::Report],
            Self::Report => &[Self::Verification, Self::Terminal],
            Self::Terminal => &[Self::Report],
        }
    }
}

impl std::fmt::Display for DebatePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Session lifecycle status. Transitions are strictly forward:
/// Pending → Running → {Completed | Failed | Cancelled}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Cancelled,
    Failed,
    Completed,
}

impl SessionStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Failed | Self::Completed)
    }

    /// Whether a transition to `to` is allowed. No reverse transitions.
    pub fn can_transition_to(self, to: SessionStatus) -> bool {
        match self {
            Self::Pending => matches!(to, Self::Running | Self::Cancelled | Self::Failed),
            Self::Running => to.is_terminal(),
            Self::Cancelled | Self::Failed | Self::Completed => false,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Completed => "completed",
        };
        write!(f, "{name}")
    }
}

/// Incident severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentSeverity {
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for IncidentSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        };
        write!(f, "{name}")
    }
}

/// Immutable incident input bound to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    /// Opaque identifier.
    pub id: String,
    /// Short title.
    pub title: String,
    /// Free-text description.
    pub description: String,
    /// Severity classification.
    pub severity: IncidentSeverity,
    /// Affected service name.
    pub service: String,
    /// Deployment environment (e.g. "production").
    pub environment: String,
    /// Free-text log content attached to the incident.
    pub log_content: String,
}

/// Role of a conversational turn author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    Supervisor,
    Specialist,
    System,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Supervisor => "supervisor",
            Self::Specialist => "specialist",
            Self::System => "system",
        };
        write!(f, "{name}")
    }
}

/// One conversational turn in the debate transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateMessage {
    /// Unique message id; duplicates are suppressed on merge.
    pub id: String,
    /// Author role.
    pub role: MessageRole,
    /// Author agent name ("Supervisor" for supervisor turns).
    pub agent_name: String,
    /// Phase the message was produced in.
    pub phase: DebatePhase,
    /// Message body.
    pub content: String,
    /// Production timestamp.
    pub timestamp: DateTime<Utc>,
}

impl DebateMessage {
    /// Create a message with a fresh id.
    pub fn new(
        role: MessageRole,
        agent_name: &str,
        phase: DebatePhase,
        content: &str,
    ) -> Self {
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            role,
            agent_name: agent_name.to_string(),
            phase,
            content: content.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Kind of source an evidence item cites.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Log,
    Code,
    Domain,
    Metric,
    Change,
    Runbook,
    Trace,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Code => "code",
            Self::Domain => "domain",
            Self::Metric => "metric",
            Self::Change => "change",
            Self::Runbook => "runbook",
            Self::Trace => "trace",
        }
    }

    /// Parse a loosely-formatted kind string.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "log" | "logs" => Some(Self::Log),
            "code" | "source" => Some(Self::Code),
            "domain" | "business" => Some(Self::Domain),
            "metric" | "metrics" => Some(Self::Metric),
            "change" | "deploy" | "release" => Some(Self::Change),
            "runbook" | "case" => Some(Self::Runbook),
            "trace" | "tracing" => Some(Self::Trace),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How strongly an evidence item supports its claim.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceStrength {
    Weak,
    Medium,
    Strong,
}

impl EvidenceStrength {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "strong" | "high" => Self::Strong,
            "weak" | "low" => Self::Weak,
            _ => Self::Medium,
        }
    }
}

impl std::fmt::Display for EvidenceStrength {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Weak => "weak",
            Self::Medium => "medium",
            Self::Strong => "strong",
        };
        write!(f, "{name}")
    }
}

/// Canonicalize a source reference before hashing: trim, collapse inner
/// whitespace, lowercase any URL scheme/host prefix. Two agents citing the
/// same log line with incidental formatting differences produce the same id.
pub fn canonicalize_source_ref(source_ref: &str) -> String {
    let collapsed: String = source_ref.split_whitespace().collect::<Vec<_>>().join(" ");
    for scheme in ["http://", "https://"] {
        let bytes = collapsed.as_bytes();
        if bytes.len() < scheme.len()
            || !bytes[..scheme.len()].eq_ignore_ascii_case(scheme.as_bytes())
        {
            continue;
        }
        // The matched prefix is pure ASCII, so the slice boundary is valid.
        let remainder = &collapsed[scheme.len()..];
        let (host, path) = remainder.split_once('/').unwrap_or((remainder, ""));
        if path.is_empty() {
            return format!("{scheme}{}", host.to_ascii_lowercase());
        }
        return format!("{scheme}{}/{}", host.to_ascii_lowercase(), path);
    }
    collapsed
}

/// A citeable fact discovered during the debate. Identity is a content hash
/// over kind, canonical source reference, and description. The producing
/// agent is excluded so two agents citing the same fact de-duplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    /// Stable content-derived id (`ev_` + 16 hex chars).
    pub evidence_id: String,
    /// What kind of source this cites.
    pub source_kind: SourceKind,
    /// Canonicalized source reference (file:line, log offset, URL, ...).
    pub source_ref: String,
    /// Human-readable description of the fact.
    pub description: String,
    /// Support strength.
    pub strength: EvidenceStrength,
    /// Agent that first produced this item.
    pub producing_agent: String,
}

impl Evidence {
    /// Build an evidence item, canonicalizing the source reference and
    /// deriving the content hash id.
    pub fn new(
        source_kind: SourceKind,
        source_ref: &str,
        description: &str,
        strength: EvidenceStrength,
        producing_agent: &str,
    ) -> Self {
        let canonical = canonicalize_source_ref(source_ref);
        let description = description.trim().to_string();
        let evidence_id = Self::derive_id(source_kind, &canonical, &description);
        Self {
            evidence_id,
            source_kind,
            source_ref: canonical,
            description,
            strength,
            producing_agent: producing_agent.to_string(),
        }
    }

    /// Content hash: `ev_` + first 16 hex chars of
    /// SHA-256(`kind|source_ref|description`).
    pub fn derive_id(source_kind: SourceKind, source_ref: &str, description: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source_kind.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(source_ref.as_bytes());
        hasher.update(b"|");
        hasher.update(description.as_bytes());
        let digest = hasher.finalize();
        format!("ev_{}", hex::encode(&digest[..8]))
    }
}

/// Tool usage directive attached to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolUse {
    /// Tools must not be invoked for this command.
    Forbidden,
    /// Tools may be invoked if enabled and allow-listed.
    Optional,
    /// Listed tools must be consulted before the LLM call.
    Required,
}

impl std::fmt::Display for ToolUse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Forbidden => "forbidden",
            Self::Optional => "optional",
            Self::Required => "required",
        };
        write!(f, "{name}")
    }
}

/// A supervisor-issued command for one specialist. Per-key replace: a new
/// command for the same agent supersedes the previous one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCommand {
    /// Round the command was issued in.
    pub issued_round: u32,
    /// What the agent should do.
    pub task: String,
    /// Narrowed focus for this round.
    pub focus: String,
    /// Identifier of the expected structured output schema.
    pub expected_output_schema_id: String,
    /// Tool usage directive.
    pub use_tool: ToolUse,
    /// Tools the command targets (relevant for Optional/Required).
    pub tool_targets: BTreeSet<ToolKind>,
    /// Per-invocation deadline in milliseconds.
    pub deadline_ms: u64,
}

/// Outcome status of a specialist round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackStatus {
    /// Completed with usable structured output.
    Ok,
    /// Timed out, failed transiently, or produced unparsable output;
    /// the debate proceeds without this input.
    Degraded,
    /// Non-retryable configuration failure.
    Failed,
}

impl std::fmt::Display for FeedbackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// Specialist feedback bound for the supervisor. Per-key replace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentFeedback {
    /// Round this feedback answers.
    pub round: u32,
    /// Outcome status.
    pub status: FeedbackStatus,
    /// One-paragraph summary of the agent's finding.
    pub summary: String,
    /// Evidence ids cited by this round (must exist in `evidence`).
    pub evidence_refs: BTreeSet<String>,
    /// Self-reported confidence in [0, 1].
    pub confidence: f64,
    /// Information the agent lacked.
    pub missing_info: Vec<String>,
    /// Questions the agent wants other specialists to address.
    pub open_questions: Vec<String>,
}

impl AgentFeedback {
    /// Synthesize a degraded entry for a settled-but-unusable round.
    pub fn degraded(round: u32, summary: &str) -> Self {
        Self {
            round,
            status: FeedbackStatus::Degraded,
            summary: summary.to_string(),
            evidence_refs: BTreeSet::new(),
            confidence: 0.0,
            missing_info: Vec::new(),
            open_questions: Vec::new(),
        }
    }

    /// Synthesize a failed entry for a configuration error.
    pub fn failed(round: u32, summary: &str) -> Self {
        Self {
            status: FeedbackStatus::Failed,
            ..Self::degraded(round, summary)
        }
    }
}

/// Routing slice of the state. Reducer: replace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteState {
    /// Current debate phase.
    pub current_phase: DebatePhase,
    /// Node the supervisor pinned for the next pump iteration, if any.
    pub next_node: Option<String>,
    /// Critique/rebuttal loop counter (0 before the first critique round).
    pub loop_round: u32,
}

impl Default for RouteState {
    fn default() -> Self {
        Self {
            current_phase: DebatePhase::Init,
            next_node: None,
            loop_round: 0,
        }
    }
}

/// Counters accumulated across the session. Reducer: element-wise add.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DebateMetrics {
    /// Wall-clock latency per phase, in milliseconds.
    pub phase_latencies_ms: BTreeMap<String, u64>,
    /// LLM attempts beyond the first, summed.
    pub retry_counts: u64,
    /// LLM attempt timeouts, summed.
    pub timeout_counts: u64,
    /// Approximate prompt tokens, summed.
    pub prompt_tokens: u64,
    /// Approximate completion tokens, summed.
    pub completion_tokens: u64,
    /// Agent rounds that ended without structured output.
    pub unstructured_outputs: u64,
}

impl DebateMetrics {
    /// Element-wise add `other` into `self`.
    pub fn absorb(&mut self, other: &DebateMetrics) {
        for (phase, latency) in &other.phase_latencies_ms {
            *self.phase_latencies_ms.entry(phase.clone()).or_insert(0) += latency;
        }
        self.retry_counts += other.retry_counts;
        self.timeout_counts += other.timeout_counts;
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.unstructured_outputs += other.unstructured_outputs;
    }

    /// Whether every counter is zero.
    pub fn is_empty(&self) -> bool {
        self.phase_latencies_ms.is_empty()
            && self.retry_counts == 0
            && self.timeout_counts == 0
            && self.prompt_tokens == 0
            && self.completion_tokens == 0
            && self.unstructured_outputs == 0
    }
}

/// Risk classification attached to the final adjudication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Self::Low,
            "high" => Self::High,
            "critical" => Self::Critical,
            _ => Self::Medium,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{name}")
    }
}

/// The structured adjudication written once by the judgment phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResult {
    /// Root-cause statement.
    pub root_cause: String,
    /// Judge confidence in (0, 1].
    pub confidence: f64,
    /// Evidence ids cited; must span at least two source kinds.
    pub evidence_chain: Vec<String>,
    /// Business/user impact statement.
    pub impact: String,
    /// Recommended fix.
    pub fix_recommendation: String,
    /// How the conclusion should be verified.
    pub verification_plan: String,
    /// Risk classification.
    pub risk_level: RiskLevel,
}

/// The shared debate state. Mutated only through
/// [`DebateState::apply`](crate::state::StateDelta) by the single executor
/// pump; parallel specialists return deltas that are merged serially.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebateState {
    /// Append-only conversational transcript; duplicate ids suppressed.
    pub messages: Vec<DebateMessage>,
    /// Shallow-merged context mapping (see [`super::context_keys`]).
    pub context: BTreeMap<String, serde_json::Value>,
    /// Pending command per agent; per-key replace.
    pub commands: BTreeMap<String, AgentCommand>,
    /// Latest feedback per agent; per-key replace.
    pub feedback: BTreeMap<String, AgentFeedback>,
    /// Ordered, content-deduplicated evidence set.
    pub evidence: Vec<Evidence>,
    /// Latest raw structured output per agent; per-key replace.
    pub agent_outputs: BTreeMap<String, serde_json::Value>,
    /// Routing slice; replace.
    pub route: RouteState,
    /// Accumulated counters; element-wise add.
    pub metrics: DebateMetrics,
    /// Set-once adjudication.
    pub final_result: Option<FinalResult>,
}

impl DebateState {
    /// Whether an evidence id is present.
    pub fn has_evidence(&self, evidence_id: &str) -> bool {
        self.evidence.iter().any(|e| e.evidence_id == evidence_id)
    }

    /// Look up an evidence item by id.
    pub fn evidence_by_id(&self, evidence_id: &str) -> Option<&Evidence> {
        self.evidence.iter().find(|e| e.evidence_id == evidence_id)
    }

    /// Distinct source kinds among the given evidence ids.
    pub fn distinct_source_kinds(&self, ids: &[String]) -> BTreeSet<SourceKind> {
        ids.iter()
            .filter_map(|id| self.evidence_by_id(id))
            .map(|e| e.source_kind)
            .collect()
    }

    /// Agents commanded in `round` that have not yet posted feedback for it.
    /// A round is complete only when this is empty (degraded entries count
    /// as posted).
    pub fn pending_agents(&self, round: u32) -> Vec<String> {
        let mut pending: Vec<String> = self
            .commands
            .iter()
            .filter(|(name, cmd)| {
                cmd.issued_round == round
                    && !self
                        .feedback
                        .get(*name)
                        .map(|fb| fb.round >= round)
                        .unwrap_or(false)
            })
            .map(|(name, _)| name.clone())
            .collect();
        pending.sort();
        pending
    }

    /// Compact status line for logs.
    pub fn status_line(&self) -> String {
        format!(
            "[{}] round {} | {} messages | {} evidence | {} feedback",
            self.route.current_phase,
            self.route.loop_round,
            self.messages.len(),
            self.evidence.len(),
            self.feedback.len(),
        )
    }
}
