//! BT Runtime + custom nodes (C8, C9): the AUTO-mode policy engine (§4.7).

pub mod context;
pub mod nodes;
pub mod runtime;
pub mod tree;

pub use context::ServiceContext;
pub use nodes::{Blackboard, NodeKind};
pub use runtime::{BtHealth, BtRuntime, DEFAULT_TICK_RATE_HZ, MAX_TICK_RATE_HZ, MIN_TICK_RATE_HZ, STALLED_TICK_THRESHOLD};
pub use tree::{load_tree, tick, PolicyNode};
