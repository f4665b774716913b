//! anolis-runtime: the core of a device-orchestration runtime.
//!
//! Five concurrent subsystems — provider lifecycle & supervision, the state
//! cache poller, the call router, the behavior-tree tick engine, and the mode
//! state machine — are stitched together by [`orchestrator::Orchestrator`].
//! Everything else in this crate (HTTP front-end, telemetry sink, the wire
//! protocol's actual provider-side implementation) is an external collaborator
//! whose contract is assumed, not provided here.

pub mod bt;
pub mod config;
pub mod device_registry;
pub mod error;
pub mod events;
pub mod mode;
pub mod orchestrator;
pub mod parameters;
pub mod provider;
pub mod router;
pub mod shutdown;
pub mod state_cache;
pub mod supervisor;
pub mod value;
