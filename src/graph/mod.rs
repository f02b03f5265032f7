//! Graph-structured debate scheduler: node registry, conditional routing,
//! and the checkpointing pump executor.

mod builder;
mod executor;
mod nodes;
mod routing;

pub use builder::{DebateNode, GraphBuilder, NodeContext, NodeError};
pub use executor::{ExecutorOutcome, GraphError, GraphExecutor};
pub use nodes::agent_node_name;
pub use routing::{route, NextNode};
