//! Tree composition and RON loading (§6.2).
//!
//! `bonsai_bt` supplies the status vocabulary (`Running`/`Success`/`Failure`)
//! this crate ticks against; composition is driven here rather than through
//! `bonsai_bt::BT::tick` because the custom nodes need a borrowed
//! [`crate::bt::context::ServiceContext`] threaded through every call, which
//! doesn't fit an owned-blackboard tick callback.

use bonsai_bt::Status;
use serde::{Deserialize, Serialize};

use crate::bt::context::ServiceContext;
use crate::bt::nodes::{self, Blackboard, NodeKind};
use crate::error::{ErrorKind, Result, RuntimeError};

/// A policy tree: leaves are [`NodeKind`] actions, composed with the usual
/// sequence/selector/invert control nodes (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PolicyNode {
    Action(NodeKind),
    Sequence(Vec<PolicyNode>),
    Selector(Vec<PolicyNode>),
    Invert(Box<PolicyNode>),
}

/// Loads a tree from a RON file on disk (§6.2 `load_tree`).
pub fn load_tree(path: &std::path::Path) -> Result<PolicyNode> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| RuntimeError::new(ErrorKind::Internal, format!("reading tree file '{}': {e}", path.display())))?;
    ron::from_str(&contents)
        .map_err(|e| RuntimeError::new(ErrorKind::Internal, format!("parsing tree file '{}': {e}", path.display())))
}

/// Ticks `node` once, recursing depth-first. Sequence short-circuits on the
/// first non-`Success` child; Selector short-circuits on the first
/// non-`Failure` child — the usual BT semantics.
pub fn tick(node: &PolicyNode, ctx: &ServiceContext<'_>, bb: &mut Blackboard) -> Status {
    match node {
        PolicyNode::Action(kind) => nodes::execute(kind, ctx, bb),
        PolicyNode::Sequence(children) => {
            for child in children {
                match tick(child, ctx, bb) {
                    Status::Success => continue,
                    other => return other,
                }
            }
            Status::Success
        }
        PolicyNode::Selector(children) => {
            for child in children {
                match tick(child, ctx, bb) {
                    Status::Failure => continue,
                    other => return other,
                }
            }
            Status::Failure
        }
        PolicyNode::Invert(child) => match tick(child, ctx, bb) {
            Status::Success => Status::Failure,
            Status::Failure => Status::Success,
            Status::Running => Status::Running,
        },
    }
}
