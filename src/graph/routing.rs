//! Pure routing function over the debate state.
//!
//! Consults only `route.current_phase`, pending-feedback completeness, and
//! the pinned `next_node`. No I/O, bounded by the size of the command map.
//! When several dedicated agent nodes are equally pending the lexicographic
//! first wins (the aggregate node handles the >1 case).

use super::nodes::{agent_node_name, TERMINAL_END_MARKER};
use crate::state::{context_keys, DebatePhase, DebateState};

/// Routing result: the next node to pump, or the end of the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextNode {
    Node(String),
    End,
}

impl NextNode {
    pub fn node(name: &str) -> Self {
        Self::Node(name.to_string())
    }
}

/// Compute the next node for a state snapshot.
pub fn route(state: &DebateState) -> NextNode {
    // A node may pin its successor (the terminal node pins the end marker).
    if let Some(pinned) = state.route.next_node.as_deref() {
        if pinned == TERMINAL_END_MARKER {
            return NextNode::End;
        }
    }

    match state.route.current_phase {
        DebatePhase::Init => NextNode::node("init_session"),
        DebatePhase::AssetMapping => {
            if state.context.contains_key(context_keys::ASSET_MAPPING) {
                NextNode::node("supervisor_decide")
            } else {
                NextNode::node("collect_assets")
            }
        }
        DebatePhase::Analysis | DebatePhase::Critique | DebatePhase::Rebuttal => {
            let pending = state.pending_agents(state.route.loop_round);
            match pending.len() {
                0 => NextNode::node("supervisor_decide"),
                1 => NextNode::Node(agent_node_name(&pending[0])),
                _ => NextNode::node("aggregate"),
            }
        }
        DebatePhase::Judgment => {
            let judged = state
                .feedback
                .get("JudgeAgent")
                .map(|fb| fb.round >= state.route.loop_round)
                .unwrap_or(false);
            if state.final_result.is_some() || judged {
                NextNode::node("supervisor_decide")
            } else {
                NextNode::node("judge")
            }
        }
        DebatePhase::Verification => {
            let verified = state
                .feedback
                .get("VerificationAgent")
                .map(|fb| fb.round >= state.route.loop_round)
                .unwrap_or(false);
            if verified {
                NextNode::node("supervisor_decide")
            } else {
                NextNode::node("verify")
            }
        }
        DebatePhase::Report => NextNode::node("report"),
        DebatePhase::Terminal => NextNode::node("terminal"),
    }
}
