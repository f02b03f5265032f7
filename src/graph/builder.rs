//! Node contract and the graph builder.
//!
//! A node is a named async unit over the shared state: it receives a state
//! snapshot and returns a delta. Nodes are effectively idempotent under
//! checkpoint replay: re-executing with the same input yields an
//! equivalent delta modulo monotonic ids.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::nodes::{
    agent_node_name, AggregateNode, CollectAssetsNode, InitSessionNode, JudgeNode, ReportNode,
    SpecialistNode, SupervisorDecideNode, TerminalNode, VerifyNode,
};
use crate::agents::{AgentRegistry, AgentRunner};
use crate::config::DebateConfig;
use crate::events::SharedDispatcher;
use crate::phase::PhaseExecutor;
use crate::report::{ReportGuard, ReportRenderer};
use crate::session::CancelFlag;
use crate::state::{DebateState, Incident, StateDelta, StateError};
use crate::supervisor::SupervisorRouter;

/// Error type for node execution.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Cooperative cancellation observed.
    #[error("session cancelled")]
    Cancelled,

    /// The report guard rejected the adjudication.
    #[error("no valid conclusion: {reason}")]
    NoValidConclusion { reason: String, retry_hint: String },

    /// A reducer rejected the node's delta (fatal invariant violation).
    #[error("invariant violation: {0}")]
    Invariant(#[from] StateError),

    /// Anything else; treated as fatal.
    #[error("node failed: {0}")]
    Internal(String),
}

/// Everything a node may touch, shared across the session.
pub struct NodeContext {
    pub session_id: String,
    pub incident: Incident,
    pub config: Arc<DebateConfig>,
    pub registry: Arc<AgentRegistry>,
    pub dispatcher: SharedDispatcher,
    pub runner: Arc<AgentRunner>,
    pub phases: Arc<PhaseExecutor>,
    pub supervisor: Arc<SupervisorRouter>,
    pub guard: Arc<ReportGuard>,
    pub renderer: Arc<dyn ReportRenderer>,
    pub cancel: CancelFlag,
}

/// A named executable unit over the shared state.
#[async_trait]
pub trait DebateNode: Send + Sync {
    /// Stable node name; feeds routing and event-id derivation.
    fn name(&self) -> &str;

    /// Execute against a snapshot and return the delta to merge.
    async fn run(&self, ctx: &NodeContext, state: &DebateState)
        -> Result<StateDelta, NodeError>;
}

/// Declares the directed debate graph: named nodes plus the routing
/// function over the state (see [`super::route`]).
pub struct GraphBuilder {
    nodes: BTreeMap<String, Arc<dyn DebateNode>>,
}

impl GraphBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
        }
    }

    /// Register a node under its own name.
    pub fn add_node(&mut self, node: Arc<dyn DebateNode>) -> &mut Self {
        self.nodes.insert(node.name().to_string(), node);
        self
    }

    /// The standard debate graph: init, asset collection, supervisor,
    /// one dedicated node per registered agent, the parallel aggregate
    /// node, judge, verify, report, and terminal.
    pub fn standard(registry: &AgentRegistry) -> Self {
        let mut builder = Self::new();
        builder.add_node(Arc::new(InitSessionNode));
        builder.add_node(Arc::new(CollectAssetsNode));
        builder.add_node(Arc::new(SupervisorDecideNode));
        builder.add_node(Arc::new(AggregateNode));
        for name in registry.names() {
            builder.add_node(Arc::new(SpecialistNode::new(&name)));
        }
        builder.add_node(Arc::new(JudgeNode));
        builder.add_node(Arc::new(VerifyNode));
        builder.add_node(Arc::new(ReportNode));
        builder.add_node(Arc::new(TerminalNode));
        builder
    }

    /// Look up a node.
    pub fn get(&self, name: &str) -> Option<Arc<dyn DebateNode>> {
        self.nodes.get(name).cloned()
    }

    /// Registered node names, in stable order.
    pub fn node_names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Finish building.
    pub fn build(self) -> BTreeMap<String, Arc<dyn DebateNode>> {
        self.nodes
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_graph_registers_expected_nodes() {
        let registry = AgentRegistry::standard();
        let builder = GraphBuilder::standard(&registry);
        let names = builder.node_names();

        for expected in [
            "init_session",
            "collect_assets",
            "supervisor_decide",
            "aggregate",
            "judge",
            "verify",
            "report",
            "terminal",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
        // One dedicated node per registered agent.
        assert!(names.contains(&agent_node_name("LogAgent")));
        assert!(names.contains(&agent_node_name("CriticAgent")));
        assert!(builder.get("aggregate").is_some());
        assert!(builder.get("missing").is_none());
    }
}
