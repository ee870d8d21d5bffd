//! Resource multiplexing.
//!
//! A resource is a named replicated state machine instance multiplexed over
//! client sessions. This module holds the type registry that maps a
//! `type_id` to a machine factory, the multiplexer that routes
//! session-scoped operations to the right instance, and the built-in
//! `value` and `counter` resource machines.

pub mod counter;
pub mod multiplexer;
pub mod registry;
pub mod value;

pub use multiplexer::{CommandDispatch, ResourceMultiplexer, SessionEvent};
pub use registry::{MachineFactory, ResourceTypeRegistry};

use serde::{Deserialize, Serialize};

use crate::types::ResourceId;

/// Lifecycle of a state machine instance.
///
/// `Created → Open` on first open, `Open → Quiescent` when the last holder
/// releases a machine that reports itself quiescent, `Quiescent → Open` on
/// a new open, `Quiescent → Destroyed` on a reaper pass. Destroyed is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Created,
    Open,
    Quiescent,
    Destroyed,
}

/// An event leaving a state machine, tagged with the resource that produced
/// it so client-side dispatch can deliver it to the right handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceEvent {
    pub resource_id: ResourceId,
    pub payload: Vec<u8>,
}
