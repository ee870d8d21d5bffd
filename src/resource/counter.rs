//! Distributed counter resource.
//!
//! A replicated signed 64-bit counter with increment/add/set and
//! compare-and-set semantics.

use serde::{Deserialize, Serialize};

use crate::buffer::{BufferReader, BufferWriter};
use crate::machine::{MachineContext, MachineError, StateMachine};
use crate::protocol::Consistency;
use crate::types::{CommitIndex, SessionId, TypeId};

/// Type id of the built-in counter resource.
pub const COUNTER_TYPE: TypeId = TypeId(2);

/// Commands accepted by a counter resource. Mutations return the resulting
/// value except where noted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterCommand {
    /// Add one; returns the new value.
    Increment,
    /// Subtract one; returns the new value.
    Decrement,
    /// Add `delta`; returns the new value.
    Add { delta: i64 },
    /// Replace the value; returns the new value.
    Set { value: i64 },
    /// Replace iff current equals `expect`; returns whether it swapped.
    CompareAndSet { expect: i64, update: i64 },
}

/// Queries accepted by a counter resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterQuery {
    Get,
}

/// State machine backing the counter resource.
#[derive(Debug, Default)]
pub struct CounterMachine {
    value: i64,
}

impl CounterMachine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateMachine for CounterMachine {
    fn apply_command(
        &mut self,
        ctx: &mut MachineContext,
        _session: SessionId,
        payload: &[u8],
    ) -> Result<Vec<u8>, MachineError> {
        let command: CounterCommand = decode(payload)?;
        match command {
            CounterCommand::Increment => {
                self.value = self.value.wrapping_add(1);
                Ok(encode(&self.value))
            }
            CounterCommand::Decrement => {
                self.value = self.value.wrapping_sub(1);
                Ok(encode(&self.value))
            }
            CounterCommand::Add { delta } => {
                self.value = self.value.wrapping_add(delta);
                Ok(encode(&self.value))
            }
            CounterCommand::Set { value } => {
                self.value = value;
                // Everything before an absolute write is superseded.
                ctx.release_up_to(CommitIndex::new(ctx.index().value().saturating_sub(1)));
                Ok(encode(&self.value))
            }
            CounterCommand::CompareAndSet { expect, update } => {
                if self.value == expect {
                    self.value = update;
                    ctx.release_up_to(CommitIndex::new(ctx.index().value().saturating_sub(1)));
                    Ok(encode(&true))
                } else {
                    Ok(encode(&false))
                }
            }
        }
    }

    fn apply_query(
        &self,
        _session: SessionId,
        payload: &[u8],
        _consistency: Consistency,
    ) -> Result<Vec<u8>, MachineError> {
        let query: CounterQuery = decode(payload)?;
        match query {
            CounterQuery::Get => Ok(encode(&self.value)),
        }
    }

    fn is_quiescent(&self) -> bool {
        self.value == 0
    }

    fn snapshot(&self, writer: &mut BufferWriter) -> Result<(), MachineError> {
        writer.write_u64(self.value as u64);
        Ok(())
    }

    fn restore(&mut self, reader: &mut BufferReader) -> Result<(), MachineError> {
        let raw = reader
            .read_u64()
            .map_err(|e| MachineError::new(e.to_string()))?;
        self.value = raw as i64;
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serialize(value).expect("counter encoding cannot fail")
}

fn decode<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T, MachineError> {
    bincode::deserialize(payload).map_err(|e| MachineError::new(format!("bad payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(machine: &mut CounterMachine, index: u64, command: CounterCommand) -> Vec<u8> {
        let mut ctx = MachineContext::new(CommitIndex::new(index));
        machine
            .apply_command(&mut ctx, SessionId::new(1), &encode(&command))
            .unwrap()
    }

    fn get(machine: &CounterMachine) -> i64 {
        let bytes = machine
            .apply_query(
                SessionId::new(1),
                &encode(&CounterQuery::Get),
                Consistency::Sequential,
            )
            .unwrap();
        bincode::deserialize(&bytes).unwrap()
    }

    #[test]
    fn test_increment_returns_new_value() {
        let mut machine = CounterMachine::new();
        let result: i64 = bincode::deserialize(&apply(&mut machine, 1, CounterCommand::Increment)).unwrap();
        assert_eq!(result, 1);
        let result: i64 = bincode::deserialize(&apply(&mut machine, 2, CounterCommand::Increment)).unwrap();
        assert_eq!(result, 2);
        assert_eq!(get(&machine), 2);
    }

    #[test]
    fn test_add_and_decrement() {
        let mut machine = CounterMachine::new();
        apply(&mut machine, 1, CounterCommand::Add { delta: 10 });
        apply(&mut machine, 2, CounterCommand::Decrement);
        assert_eq!(get(&machine), 9);
    }

    #[test]
    fn test_compare_and_set() {
        let mut machine = CounterMachine::new();
        apply(&mut machine, 1, CounterCommand::Set { value: 5 });

        let swapped: bool = bincode::deserialize(&apply(
            &mut machine,
            2,
            CounterCommand::CompareAndSet {
                expect: 5,
                update: 8,
            },
        ))
        .unwrap();
        assert!(swapped);

        let swapped: bool = bincode::deserialize(&apply(
            &mut machine,
            3,
            CounterCommand::CompareAndSet {
                expect: 5,
                update: 1,
            },
        ))
        .unwrap();
        assert!(!swapped);
        assert_eq!(get(&machine), 8);
    }

    #[test]
    fn test_set_releases_history() {
        let mut machine = CounterMachine::new();
        let mut ctx = MachineContext::new(CommitIndex::new(9));
        machine
            .apply_command(
                &mut ctx,
                SessionId::new(1),
                &encode(&CounterCommand::Set { value: 3 }),
            )
            .unwrap();
        let (_, released) = ctx.into_effects();
        assert_eq!(released, Some(CommitIndex::new(8)));
    }

    #[test]
    fn test_increment_releases_nothing() {
        let mut machine = CounterMachine::new();
        let mut ctx = MachineContext::new(CommitIndex::new(4));
        machine
            .apply_command(&mut ctx, SessionId::new(1), &encode(&CounterCommand::Increment))
            .unwrap();
        let (_, released) = ctx.into_effects();
        assert_eq!(released, None);
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let mut machine = CounterMachine::new();
        apply(&mut machine, 1, CounterCommand::Set { value: -17 });

        let buffer = crate::buffer::Buffer::detached();
        let mut writer = buffer.writer();
        machine.snapshot(&mut writer).unwrap();
        drop(writer);

        let mut restored = CounterMachine::new();
        let mut reader = buffer.reader();
        restored.restore(&mut reader).unwrap();
        assert_eq!(get(&restored), -17);
    }

    #[test]
    fn test_quiescent_at_zero() {
        let mut machine = CounterMachine::new();
        assert!(machine.is_quiescent());
        apply(&mut machine, 1, CounterCommand::Increment);
        assert!(!machine.is_quiescent());
        apply(&mut machine, 2, CounterCommand::Decrement);
        assert!(machine.is_quiescent());
    }
}
