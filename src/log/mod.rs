//! The replicated-log interface consumed from the consensus layer.
//!
//! Raft consensus itself is an external collaborator: the session layer only
//! requires a log that commits entries, applies them in strict commit order,
//! answers read-index requests for linearizable reads, takes and restores
//! snapshots, and honors compaction watermarks. [`ReplicatedLog`] captures
//! those primitives and [`LocalLog`](local::LocalLog) implements them
//! in-process for embedding, testing, and single-node deployments.

pub mod local;

pub use local::{LocalLog, LocalLogOptions};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::CoordResult;
use crate::protocol::Consistency;
use crate::types::{
    ClientId, CommitIndex, EventIndex, ResourceId, Sequence, SessionId, TypeId,
};

/// Session-relevant log entry kinds, replicated and applied deterministically
/// on every replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntry {
    /// Creates a session.
    Register { client_id: ClientId, timeout_ms: u64 },

    /// Renews liveness and acknowledges progress.
    KeepAlive {
        session_id: SessionId,
        command_sequence_ack: Sequence,
        event_index_ack: EventIndex,
    },

    /// A user command addressed to a resource.
    Command {
        session_id: SessionId,
        sequence: Sequence,
        resource_id: ResourceId,
        type_id: TypeId,
        payload: Vec<u8>,
    },

    /// Graceful session close.
    Unregister { session_id: SessionId },

    /// No-op barrier, committed to confirm leadership for linearizable
    /// reads.
    Noop,
}

/// A committed entry with the index, term, and timestamp assigned by the
/// log layer. Entry timestamps are the logical clock for session liveness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Committed {
    pub index: CommitIndex,
    pub term: u64,
    pub timestamp_ms: u64,
    pub entry: LogEntry,
}

/// Outcome of applying a command entry for a session.
#[derive(Debug)]
pub struct CommandOutcome {
    /// Commit index at which the command was applied.
    pub index: CommitIndex,
    /// The session's event index after the command's events were published.
    pub event_index: EventIndex,
    /// Result bytes, or the error to surface to the issuing client.
    pub result: CoordResult<Vec<u8>>,
}

/// Completion handle for a command: resolves once the command actually
/// applies, which may be later than its commit if earlier sequences are
/// still missing.
pub type CommandCompletion = oneshot::Receiver<CommandOutcome>;

/// Result of applying one committed entry.
#[derive(Debug)]
pub enum ApplyResult {
    /// A session was created.
    Registered {
        session_id: SessionId,
        timeout_ms: u64,
    },
    /// Keep-alive processed (or rejected for an unknown session).
    KeepAlive(CoordResult<()>),
    /// Command accepted for application; the completion resolves with the
    /// outcome.
    Command(CommandCompletion),
    /// Session closed (or the session was unknown).
    Unregistered(CoordResult<()>),
    /// Nothing to report (barriers).
    None,
}

/// Callback through which the log drives the state above it.
///
/// `apply` is invoked in strict commit order, one entry in flight at a time.
#[async_trait]
pub trait LogApplier: Send + Sync {
    async fn apply(&self, committed: Committed) -> ApplyResult;

    /// Capture all state into a deterministic snapshot.
    async fn snapshot(&self) -> CoordResult<Vec<u8>>;

    /// Rebuild all state from a snapshot.
    async fn restore(&self, data: &[u8]) -> CoordResult<()>;

    /// Lowest commit index still referenced by any session's result cache,
    /// if any. Entries at or above this index must survive compaction.
    fn lowest_pinned_index(&self) -> Option<CommitIndex>;
}

/// The log-layer primitives the session core consumes.
#[async_trait]
pub trait ReplicatedLog: Send + Sync {
    /// Commit a mutation and apply it; resolves once the entry has been
    /// committed and the applier has run.
    async fn append(&self, entry: LogEntry) -> CoordResult<(CommitIndex, ApplyResult)>;

    /// The commit index at which a read with the given consistency may be
    /// evaluated.
    async fn read_index(&self, consistency: Consistency) -> CoordResult<CommitIndex>;

    /// Capture and persist a snapshot now; returns the index it covers.
    async fn snapshot_now(&self) -> CoordResult<CommitIndex>;

    /// Declare that `machine` no longer needs entries at or below
    /// `release_up_to` for its observable state.
    fn register_compaction_watermark(&self, machine: ResourceId, release_up_to: CommitIndex);

    /// Highest committed index.
    fn commit_index(&self) -> CommitIndex;

    /// Address of the current leader, if known.
    fn leader(&self) -> Option<String>;
}

/// Aggregates per-machine compaction watermarks.
///
/// A log position is droppable once every live machine has released it and
/// no session's result cache pins it. Machines are tracked from instantiation
/// (releasing nothing) until destruction (releasing everything).
#[derive(Debug, Default)]
pub struct CompactionTracker {
    watermarks: DashMap<ResourceId, u64>,
}

impl CompactionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a machine; it initially retains the whole log.
    pub fn track(&self, machine: ResourceId) {
        self.watermarks.entry(machine).or_insert(0);
    }

    /// Stop tracking a destroyed machine.
    pub fn untrack(&self, machine: ResourceId) {
        self.watermarks.remove(&machine);
    }

    /// Raise a machine's watermark; watermarks never move backwards.
    pub fn release(&self, machine: ResourceId, release_up_to: CommitIndex) {
        self.watermarks
            .entry(machine)
            .and_modify(|current| *current = (*current).max(release_up_to.value()))
            .or_insert(release_up_to.value());
    }

    /// Highest index every tracked machine has released, or `None` when no
    /// machine is tracked (nothing constrains compaction).
    pub fn release_floor(&self) -> Option<CommitIndex> {
        self.watermarks
            .iter()
            .map(|entry| *entry.value())
            .min()
            .map(CommitIndex::new)
    }
}

/// Millisecond time source for entry timestamps.
///
/// Swappable so tests can drive session expiry deterministically.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall-clock time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system time before UNIX epoch")
            .as_millis() as u64
    }
}

/// Manually advanced time, for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            ms: AtomicU64::new(start_ms),
        })
    }

    pub fn advance(&self, delta_ms: u64) {
        self.ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.ms.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.ms.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_floor_is_min_across_machines() {
        let tracker = CompactionTracker::new();
        assert_eq!(tracker.release_floor(), None);

        tracker.track(ResourceId::new(1));
        tracker.track(ResourceId::new(2));
        assert_eq!(tracker.release_floor(), Some(CommitIndex::ZERO));

        tracker.release(ResourceId::new(1), CommitIndex::new(10));
        assert_eq!(tracker.release_floor(), Some(CommitIndex::ZERO));

        tracker.release(ResourceId::new(2), CommitIndex::new(7));
        assert_eq!(tracker.release_floor(), Some(CommitIndex::new(7)));
    }

    #[test]
    fn test_tracker_watermarks_never_regress() {
        let tracker = CompactionTracker::new();
        tracker.track(ResourceId::new(1));
        tracker.release(ResourceId::new(1), CommitIndex::new(10));
        tracker.release(ResourceId::new(1), CommitIndex::new(4));
        assert_eq!(tracker.release_floor(), Some(CommitIndex::new(10)));
    }

    #[test]
    fn test_tracker_untrack_lifts_constraint() {
        let tracker = CompactionTracker::new();
        tracker.track(ResourceId::new(1));
        tracker.track(ResourceId::new(2));
        tracker.release(ResourceId::new(1), CommitIndex::new(20));

        tracker.untrack(ResourceId::new(2));
        assert_eq!(tracker.release_floor(), Some(CommitIndex::new(20)));
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now_ms(), 100);
        clock.advance(50);
        assert_eq!(clock.now_ms(), 150);
        clock.set(10);
        assert_eq!(clock.now_ms(), 10);
    }

    #[test]
    fn test_log_entry_roundtrip() {
        let entry = LogEntry::Command {
            session_id: SessionId::new(1),
            sequence: Sequence::new(2),
            resource_id: ResourceId::new(3),
            type_id: TypeId::new(1),
            payload: vec![1, 2, 3],
        };
        let bytes = bincode::serialize(&entry).unwrap();
        let back: LogEntry = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, entry);
    }
}
