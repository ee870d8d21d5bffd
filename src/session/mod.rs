//! Client session state.
//!
//! A session is a client's logical connection to the cluster, surviving
//! transport reconnects. The [`SessionManager`](manager::SessionManager)
//! owns the session table and enforces the ordering invariants; [`Session`]
//! is the per-session record it maintains: command sequencing state, the
//! duplicate-suppression result cache, the queue of commands waiting on a
//! sequence gap, and the buffer of published-but-unacknowledged events.

pub mod manager;

pub use manager::{ExpiryListener, SessionManager};

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::{CoordError, CoordResult};
use crate::log::CommandOutcome;
use crate::protocol::request::Event;
use crate::types::{
    ClientId, CommitIndex, EventIndex, ResourceId, Sequence, SessionId, TypeId,
};

/// Session lifecycle state.
///
/// `Expired` and `Closed` are terminal: an expired session never returns to
/// `Open` under the same id; recovery registers a new session bound to the
/// same client id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Live with an attached connection.
    Open,
    /// Live but with no attached connection; events buffer until reconnect
    /// or expiry.
    Suspended,
    /// Timed out, overflowed its event buffer, or hit the gap threshold.
    Expired,
    /// Gracefully unregistered.
    Closed,
}

impl SessionState {
    /// Whether the session can still accept operations.
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Open | SessionState::Suspended)
    }
}

/// A contiguous batch of events published to one session.
///
/// Batches carry `previous_index` so clients detect gaps: a batch is only
/// consumable if the client has processed everything up to that index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBatch {
    pub previous_index: EventIndex,
    pub event_index: EventIndex,
    pub events: Vec<Event>,
}

/// A cached command result, replayed byte-identically for retransmits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResult {
    /// Commit index of the original application.
    pub index: CommitIndex,
    /// The session's event index after the original application.
    pub event_index: EventIndex,
    pub outcome: CachedOutcome,
}

/// Serializable form of a command outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachedOutcome {
    Ok(Vec<u8>),
    /// The state machine's own error text.
    AppError(String),
    /// An infrastructure failure consumed with the entry.
    Failure(String),
}

impl CachedOutcome {
    pub fn from_result(result: &CoordResult<Vec<u8>>) -> Self {
        match result {
            Ok(bytes) => CachedOutcome::Ok(bytes.clone()),
            Err(CoordError::Application(message)) => CachedOutcome::AppError(message.clone()),
            Err(other) => CachedOutcome::Failure(other.to_string()),
        }
    }

    pub fn to_result(&self) -> CoordResult<Vec<u8>> {
        match self {
            CachedOutcome::Ok(bytes) => Ok(bytes.clone()),
            CachedOutcome::AppError(message) => Err(CoordError::Application(message.clone())),
            CachedOutcome::Failure(message) => Err(CoordError::CommandFailure(message.clone())),
        }
    }
}

/// A command held back by a sequence gap.
///
/// Kept out of snapshots: a restored replica rebuilds gap queues by
/// replaying the log suffix after the snapshot.
#[derive(Debug)]
pub struct PendingCommand {
    /// Commit index of the command's log entry.
    pub entry_index: CommitIndex,
    /// Commit index at which the gap was observed, for the gap threshold.
    pub enqueued_index: CommitIndex,
    pub resource_id: ResourceId,
    pub type_id: TypeId,
    pub payload: Vec<u8>,
    pub completion: oneshot::Sender<CommandOutcome>,
}

/// Per-session record maintained by the session manager.
#[derive(Debug)]
pub struct Session {
    pub session_id: SessionId,
    pub client_id: ClientId,
    pub timeout_ms: u64,
    pub state: SessionState,
    /// Entry timestamp of the most recent liveness-renewing entry.
    pub last_keepalive_ms: u64,
    /// Commit index of that entry.
    pub last_keepalive_index: CommitIndex,
    /// Highest contiguous command sequence applied.
    pub command_sequence: Sequence,
    /// Last event index assigned.
    pub event_index: EventIndex,
    /// Highest event index the client has acknowledged.
    pub event_ack: EventIndex,
    /// Published events not yet acknowledged, oldest first.
    pub pending_events: VecDeque<EventBatch>,
    /// Results of recently applied commands, keyed by sequence.
    pub result_cache: BTreeMap<u64, CachedResult>,
    /// Commands waiting for earlier sequences, keyed by sequence.
    pub gap_queue: BTreeMap<u64, PendingCommand>,
    /// Resources this session holds open.
    pub resources: BTreeSet<ResourceId>,
}

impl Session {
    pub fn new(
        session_id: SessionId,
        client_id: ClientId,
        timeout_ms: u64,
        registered_at_ms: u64,
        registered_at: CommitIndex,
    ) -> Self {
        Self {
            session_id,
            client_id,
            timeout_ms,
            state: SessionState::Open,
            last_keepalive_ms: registered_at_ms,
            last_keepalive_index: registered_at,
            command_sequence: Sequence::ZERO,
            event_index: EventIndex::ZERO,
            event_ack: EventIndex::ZERO,
            pending_events: VecDeque::new(),
            result_cache: BTreeMap::new(),
            gap_queue: BTreeMap::new(),
            resources: BTreeSet::new(),
        }
    }

    /// Release pending events up to and including `ack`.
    pub fn release_events(&mut self, ack: EventIndex) {
        if ack <= self.event_ack {
            return;
        }
        self.event_ack = ack;
        while let Some(front) = self.pending_events.front() {
            if front.event_index <= ack {
                self.pending_events.pop_front();
            } else {
                break;
            }
        }
    }

    /// Drop cached results up to and including `ack`.
    pub fn trim_result_cache(&mut self, ack: Sequence) {
        self.result_cache = self.result_cache.split_off(&(ack.value() + 1));
    }

    /// Commit index at which the currently open gap (if any) was observed.
    pub fn gap_opened_at(&self) -> Option<CommitIndex> {
        self.gap_queue
            .values()
            .map(|pending| pending.enqueued_index)
            .min()
    }

    /// Lowest commit index pinned by this session's result cache.
    pub fn lowest_pinned(&self) -> Option<CommitIndex> {
        self.result_cache.values().map(|cached| cached.index).min()
    }

    fn to_snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id,
            client_id: self.client_id,
            timeout_ms: self.timeout_ms,
            state: self.state,
            last_keepalive_ms: self.last_keepalive_ms,
            last_keepalive_index: self.last_keepalive_index,
            command_sequence: self.command_sequence,
            event_index: self.event_index,
            event_ack: self.event_ack,
            pending_events: self.pending_events.iter().cloned().collect(),
            result_cache: self.result_cache.clone(),
            resources: self.resources.clone(),
        }
    }

    fn from_snapshot(snapshot: SessionSnapshot) -> Self {
        Self {
            session_id: snapshot.session_id,
            client_id: snapshot.client_id,
            timeout_ms: snapshot.timeout_ms,
            // Connections do not survive a restore.
            state: match snapshot.state {
                SessionState::Open => SessionState::Suspended,
                other => other,
            },
            last_keepalive_ms: snapshot.last_keepalive_ms,
            last_keepalive_index: snapshot.last_keepalive_index,
            command_sequence: snapshot.command_sequence,
            event_index: snapshot.event_index,
            event_ack: snapshot.event_ack,
            pending_events: snapshot.pending_events.into(),
            result_cache: snapshot.result_cache,
            gap_queue: BTreeMap::new(),
            resources: snapshot.resources,
        }
    }
}

/// Serializable capture of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub client_id: ClientId,
    pub timeout_ms: u64,
    pub state: SessionState,
    pub last_keepalive_ms: u64,
    pub last_keepalive_index: CommitIndex,
    pub command_sequence: Sequence,
    pub event_index: EventIndex,
    pub event_ack: EventIndex,
    pub pending_events: Vec<EventBatch>,
    pub result_cache: BTreeMap<u64, CachedResult>,
    pub resources: BTreeSet<ResourceId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            SessionId::new(1),
            ClientId::new(1),
            5_000,
            100,
            CommitIndex::new(1),
        )
    }

    fn batch(index: u64) -> EventBatch {
        EventBatch {
            previous_index: EventIndex::new(index - 1),
            event_index: EventIndex::new(index),
            events: vec![],
        }
    }

    #[test]
    fn test_release_events_drops_acknowledged_batches() {
        let mut s = session();
        for i in 1..=5 {
            s.pending_events.push_back(batch(i));
        }
        s.event_index = EventIndex::new(5);

        s.release_events(EventIndex::new(3));
        assert_eq!(s.pending_events.len(), 2);
        assert_eq!(s.pending_events.front().unwrap().event_index, EventIndex::new(4));
        assert_eq!(s.event_ack, EventIndex::new(3));
    }

    #[test]
    fn test_release_events_ignores_stale_ack() {
        let mut s = session();
        s.pending_events.push_back(batch(1));
        s.release_events(EventIndex::new(1));

        s.release_events(EventIndex::ZERO);
        assert_eq!(s.event_ack, EventIndex::new(1));
    }

    #[test]
    fn test_trim_result_cache() {
        let mut s = session();
        for seq in 1..=4u64 {
            s.result_cache.insert(
                seq,
                CachedResult {
                    index: CommitIndex::new(seq),
                    event_index: EventIndex::ZERO,
                    outcome: CachedOutcome::Ok(vec![]),
                },
            );
        }

        s.trim_result_cache(Sequence::new(2));
        assert_eq!(s.result_cache.len(), 2);
        assert!(s.result_cache.contains_key(&3));
        assert_eq!(s.lowest_pinned(), Some(CommitIndex::new(3)));
    }

    #[test]
    fn test_cached_outcome_roundtrip() {
        let ok = CachedOutcome::from_result(&Ok(vec![1, 2]));
        assert_eq!(ok.to_result().unwrap(), vec![1, 2]);

        let app = CachedOutcome::from_result(&Err(CoordError::Application("nope".into())));
        assert_eq!(
            app.to_result().unwrap_err(),
            CoordError::Application("nope".into())
        );
    }

    #[test]
    fn test_snapshot_suspends_open_sessions() {
        let s = session();
        let restored = Session::from_snapshot(s.to_snapshot());
        assert_eq!(restored.state, SessionState::Suspended);
        assert_eq!(restored.session_id, s.session_id);
    }
}
