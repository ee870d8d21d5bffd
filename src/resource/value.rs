//! Distributed atomic value resource.
//!
//! Holds an opaque byte value with get/set/compare-and-set semantics.
//! Sessions may listen for changes; every successful mutation publishes a
//! [`ValueEvent`] to each listening session.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::buffer::{BufferReader, BufferWriter};
use crate::machine::{MachineContext, MachineError, StateMachine};
use crate::protocol::Consistency;
use crate::types::{CommitIndex, SessionId, TypeId};

/// Type id of the built-in value resource.
pub const VALUE_TYPE: TypeId = TypeId(1);

/// Commands accepted by a value resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueCommand {
    /// Replace the value.
    Set { value: Vec<u8> },
    /// Clear the value.
    Clear,
    /// Replace the value iff the current value equals `expect`.
    CompareAndSet {
        expect: Option<Vec<u8>>,
        update: Option<Vec<u8>>,
    },
    /// Start sending change events to the issuing session.
    Listen,
    /// Stop sending change events to the issuing session.
    Unlisten,
}

/// Queries accepted by a value resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueQuery {
    Get,
}

/// Change event published to listening sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueEvent {
    pub previous: Option<Vec<u8>>,
    pub current: Option<Vec<u8>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ValueState {
    value: Option<Vec<u8>>,
    listeners: BTreeSet<SessionId>,
}

/// State machine backing the value resource.
#[derive(Debug, Default)]
pub struct ValueMachine {
    state: ValueState,
    /// Entry that produced the current value; superseded entries are
    /// released for compaction.
    current_entry: Option<CommitIndex>,
}

impl ValueMachine {
    pub fn new() -> Self {
        Self::default()
    }

    fn transition(
        &mut self,
        ctx: &mut MachineContext,
        next: Option<Vec<u8>>,
    ) -> Option<Vec<u8>> {
        let previous = std::mem::replace(&mut self.state.value, next.clone());

        // The superseded entry no longer contributes to observable state.
        if let Some(entry) = self.current_entry.take() {
            ctx.release_up_to(entry);
        }
        self.current_entry = Some(ctx.index());

        let event = encode(&ValueEvent {
            previous: previous.clone(),
            current: next,
        });
        for listener in &self.state.listeners {
            ctx.publish(*listener, event.clone());
        }
        previous
    }
}

impl StateMachine for ValueMachine {
    fn on_unregister(&mut self, _ctx: &mut MachineContext, session: SessionId) {
        self.state.listeners.remove(&session);
    }

    fn on_expire(&mut self, _ctx: &mut MachineContext, session: SessionId) {
        self.state.listeners.remove(&session);
    }

    fn on_close(&mut self, _ctx: &mut MachineContext, session: SessionId) {
        self.state.listeners.remove(&session);
    }

    fn apply_command(
        &mut self,
        ctx: &mut MachineContext,
        session: SessionId,
        payload: &[u8],
    ) -> Result<Vec<u8>, MachineError> {
        let command: ValueCommand = decode(payload)?;
        match command {
            ValueCommand::Set { value } => {
                self.transition(ctx, Some(value));
                Ok(Vec::new())
            }
            ValueCommand::Clear => {
                self.transition(ctx, None);
                Ok(Vec::new())
            }
            ValueCommand::CompareAndSet { expect, update } => {
                if self.state.value == expect {
                    self.transition(ctx, update);
                    Ok(encode(&true))
                } else {
                    Ok(encode(&false))
                }
            }
            ValueCommand::Listen => {
                self.state.listeners.insert(session);
                Ok(Vec::new())
            }
            ValueCommand::Unlisten => {
                self.state.listeners.remove(&session);
                Ok(Vec::new())
            }
        }
    }

    fn apply_query(
        &self,
        _session: SessionId,
        payload: &[u8],
        _consistency: Consistency,
    ) -> Result<Vec<u8>, MachineError> {
        let query: ValueQuery = decode(payload)?;
        match query {
            ValueQuery::Get => Ok(encode(&self.state.value)),
        }
    }

    fn is_quiescent(&self) -> bool {
        self.state.value.is_none() && self.state.listeners.is_empty()
    }

    fn snapshot(&self, writer: &mut BufferWriter) -> Result<(), MachineError> {
        let bytes =
            bincode::serialize(&self.state).map_err(|e| MachineError::new(e.to_string()))?;
        writer.write_all(&bytes);
        Ok(())
    }

    fn restore(&mut self, reader: &mut BufferReader) -> Result<(), MachineError> {
        let bytes = reader.read_to_end();
        self.state =
            bincode::deserialize(&bytes).map_err(|e| MachineError::new(e.to_string()))?;
        self.current_entry = None;
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serialize(value).expect("value encoding cannot fail")
}

fn decode<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T, MachineError> {
    bincode::deserialize(payload).map_err(|e| MachineError::new(format!("bad payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(
        machine: &mut ValueMachine,
        session: u64,
        index: u64,
        command: ValueCommand,
    ) -> (Result<Vec<u8>, MachineError>, Vec<(SessionId, Vec<u8>)>) {
        let mut ctx = MachineContext::new(CommitIndex::new(index));
        let result = machine.apply_command(&mut ctx, SessionId::new(session), &encode(&command));
        let (published, _) = ctx.into_effects();
        (result, published)
    }

    fn get(machine: &ValueMachine) -> Option<Vec<u8>> {
        let bytes = machine
            .apply_query(SessionId::new(1), &encode(&ValueQuery::Get), Consistency::Sequential)
            .unwrap();
        bincode::deserialize(&bytes).unwrap()
    }

    #[test]
    fn test_set_and_get() {
        let mut machine = ValueMachine::new();
        apply(&mut machine, 1, 1, ValueCommand::Set { value: vec![42] });
        assert_eq!(get(&machine), Some(vec![42]));
    }

    #[test]
    fn test_compare_and_set() {
        let mut machine = ValueMachine::new();
        apply(&mut machine, 1, 1, ValueCommand::Set { value: vec![1] });

        let (result, _) = apply(
            &mut machine,
            1,
            2,
            ValueCommand::CompareAndSet {
                expect: Some(vec![1]),
                update: Some(vec![2]),
            },
        );
        let swapped: bool = bincode::deserialize(&result.unwrap()).unwrap();
        assert!(swapped);
        assert_eq!(get(&machine), Some(vec![2]));

        let (result, _) = apply(
            &mut machine,
            1,
            3,
            ValueCommand::CompareAndSet {
                expect: Some(vec![1]),
                update: Some(vec![9]),
            },
        );
        let swapped: bool = bincode::deserialize(&result.unwrap()).unwrap();
        assert!(!swapped);
        assert_eq!(get(&machine), Some(vec![2]));
    }

    #[test]
    fn test_listeners_receive_change_events() {
        let mut machine = ValueMachine::new();
        apply(&mut machine, 5, 1, ValueCommand::Listen);

        let (_, published) = apply(&mut machine, 1, 2, ValueCommand::Set { value: vec![7] });
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, SessionId::new(5));

        let event: ValueEvent = bincode::deserialize(&published[0].1).unwrap();
        assert_eq!(event.previous, None);
        assert_eq!(event.current, Some(vec![7]));
    }

    #[test]
    fn test_expired_session_stops_listening() {
        let mut machine = ValueMachine::new();
        apply(&mut machine, 5, 1, ValueCommand::Listen);

        let mut ctx = MachineContext::new(CommitIndex::new(2));
        machine.on_expire(&mut ctx, SessionId::new(5));

        let (_, published) = apply(&mut machine, 1, 3, ValueCommand::Set { value: vec![1] });
        assert!(published.is_empty());
    }

    #[test]
    fn test_superseded_entry_released() {
        let mut machine = ValueMachine::new();
        apply(&mut machine, 1, 1, ValueCommand::Set { value: vec![1] });

        let mut ctx = MachineContext::new(CommitIndex::new(2));
        machine
            .apply_command(
                &mut ctx,
                SessionId::new(1),
                &encode(&ValueCommand::Set { value: vec![2] }),
            )
            .unwrap();
        let (_, released) = ctx.into_effects();
        assert_eq!(released, Some(CommitIndex::new(1)));
    }

    #[test]
    fn test_quiescence() {
        let mut machine = ValueMachine::new();
        assert!(machine.is_quiescent());

        apply(&mut machine, 1, 1, ValueCommand::Set { value: vec![1] });
        assert!(!machine.is_quiescent());

        apply(&mut machine, 1, 2, ValueCommand::Clear);
        assert!(machine.is_quiescent());
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let mut machine = ValueMachine::new();
        apply(&mut machine, 1, 1, ValueCommand::Set { value: vec![3, 4] });
        apply(&mut machine, 6, 2, ValueCommand::Listen);

        let buffer = crate::buffer::Buffer::detached();
        let mut writer = buffer.writer();
        machine.snapshot(&mut writer).unwrap();
        drop(writer);

        let mut restored = ValueMachine::new();
        let mut reader = buffer.reader();
        restored.restore(&mut reader).unwrap();

        assert_eq!(get(&restored), Some(vec![3, 4]));
        assert!(!restored.is_quiescent());
    }
}
