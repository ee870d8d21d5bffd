//! Embedded state machine contract.
//!
//! A resource is backed by a state machine implementing [`StateMachine`].
//! All access is serialized by a [`Driver`](driver::Driver): commands apply
//! in log order and run to completion before the next, queries never mutate,
//! and snapshot/restore capture and rebuild state deterministically.
//! Machines publish events and release log entries through the
//! [`MachineContext`] handed to each mutating callback.

pub mod driver;

pub use driver::{CommandEffects, Driver, Lifecycle, LifecycleEffects};

use thiserror::Error as ThisError;

use crate::buffer::{BufferReader, BufferWriter};
use crate::protocol::Consistency;
use crate::types::{CommitIndex, SessionId};

/// An error produced by a state machine.
///
/// The message is application-defined and surfaced to the issuing client
/// verbatim; the session and the machine's own state are unaffected.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
#[error("{0}")]
pub struct MachineError(pub String);

impl MachineError {
    pub fn new(message: impl Into<String>) -> Self {
        MachineError(message.into())
    }
}

/// Context for mutating state machine callbacks.
///
/// Collects the events the machine publishes and the log entries it
/// releases while a single callback runs; the driver drains it afterwards.
#[derive(Debug)]
pub struct MachineContext {
    index: CommitIndex,
    published: Vec<(SessionId, Vec<u8>)>,
    released: Option<CommitIndex>,
}

impl MachineContext {
    pub(crate) fn new(index: CommitIndex) -> Self {
        Self {
            index,
            published: Vec::new(),
            released: None,
        }
    }

    /// Commit index of the entry being applied (zero for lifecycle
    /// callbacks not driven by a specific entry).
    pub fn index(&self) -> CommitIndex {
        self.index
    }

    /// Publish an event to a session. The session layer assigns the event
    /// index and handles delivery.
    pub fn publish(&mut self, session: SessionId, payload: Vec<u8>) {
        self.published.push((session, payload));
    }

    /// Declare that entries at or below `index` no longer contribute to
    /// this machine's observable state and may be compacted.
    pub fn release_up_to(&mut self, index: CommitIndex) {
        self.released = Some(match self.released {
            Some(current) => current.max(index),
            None => index,
        });
    }

    pub(crate) fn into_effects(self) -> (Vec<(SessionId, Vec<u8>)>, Option<CommitIndex>) {
        (self.published, self.released)
    }
}

/// The contract the core requires of an embedded state machine.
///
/// `apply_command` must be deterministic given the applied sequence of
/// commands; `apply_query` must not mutate state. A panic in any callback is
/// treated as fatal to the replica.
pub trait StateMachine: Send + 'static {
    /// A session holding this resource was registered.
    fn on_register(&mut self, _ctx: &mut MachineContext, _session: SessionId) {}

    /// A session holding this resource unregistered gracefully.
    fn on_unregister(&mut self, _ctx: &mut MachineContext, _session: SessionId) {}

    /// A session holding this resource expired.
    fn on_expire(&mut self, _ctx: &mut MachineContext, _session: SessionId) {}

    /// A session closed its handle to this resource.
    fn on_close(&mut self, _ctx: &mut MachineContext, _session: SessionId) {}

    /// Apply a committed command; runs to completion before the next.
    fn apply_command(
        &mut self,
        ctx: &mut MachineContext,
        session: SessionId,
        payload: &[u8],
    ) -> Result<Vec<u8>, MachineError>;

    /// Execute a query against current state.
    fn apply_query(
        &self,
        session: SessionId,
        payload: &[u8],
        consistency: Consistency,
    ) -> Result<Vec<u8>, MachineError>;

    /// True iff no sessions remain and all referenced log entries have been
    /// released; a quiescent machine may be destroyed.
    fn is_quiescent(&self) -> bool {
        true
    }

    /// Write a deterministic capture of current state.
    fn snapshot(&self, writer: &mut BufferWriter) -> Result<(), MachineError>;

    /// Rebuild state from a capture.
    fn restore(&mut self, reader: &mut BufferReader) -> Result<(), MachineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_collects_events_in_order() {
        let mut ctx = MachineContext::new(CommitIndex::new(5));
        ctx.publish(SessionId::new(1), vec![1]);
        ctx.publish(SessionId::new(2), vec![2]);

        let (published, released) = ctx.into_effects();
        assert_eq!(
            published,
            vec![(SessionId::new(1), vec![1]), (SessionId::new(2), vec![2])]
        );
        assert_eq!(released, None);
    }

    #[test]
    fn test_context_release_keeps_highest() {
        let mut ctx = MachineContext::new(CommitIndex::new(9));
        ctx.release_up_to(CommitIndex::new(4));
        ctx.release_up_to(CommitIndex::new(2));

        let (_, released) = ctx.into_effects();
        assert_eq!(released, Some(CommitIndex::new(4)));
    }
}
