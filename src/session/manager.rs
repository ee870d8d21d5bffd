//! The server-side session table and its invariants.
//!
//! The manager is the log applier: the consensus layer feeds it committed
//! entries in strict commit order and it maintains every session's command
//! sequencing, duplicate suppression, liveness, and event stream. Reads
//! (query routing, event acknowledgement) run concurrently against the
//! same table.
//!
//! Session ids are the commit index of the registering entry; liveness is
//! judged against entry timestamps; sequence gaps are bounded in commits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{
    CachedOutcome, CachedResult, EventBatch, PendingCommand, Session, SessionSnapshot,
    SessionState,
};
use crate::config::SessionConfig;
use crate::error::{CoordError, CoordResult};
use crate::log::{
    ApplyResult, Committed, CommandCompletion, CommandOutcome, LogApplier, LogEntry,
};
use crate::protocol::request::{Event, PublishRequest};
use crate::protocol::Consistency;
use crate::resource::multiplexer::{MachineSnapshot, ResourceMultiplexer, SessionEvent};
use crate::types::{
    ClientId, CommitIndex, CorrelationId, EventIndex, ResourceId, Sequence, SessionId, TypeId,
};

/// Default deadline for queries that did not specify one.
const DEFAULT_QUERY_DEADLINE: Duration = Duration::from_secs(5);

/// Poll interval while a causal query waits for its session to catch up.
const QUERY_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Why a session was expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExpireReason {
    /// Keep-alives stopped arriving within the timeout.
    Timeout,
    /// A command sequence gap stayed open past the commit threshold.
    SequenceGap { missing: u64 },
    /// The pending-event buffer exceeded its bound.
    EventOverflow,
}

/// Full deterministic capture of the session layer and its machines.
#[derive(Debug, Serialize, Deserialize)]
struct StateCapture {
    sessions: Vec<SessionSnapshot>,
    clients: Vec<(ClientId, SessionId)>,
    machines: Vec<MachineSnapshot>,
}

struct ManagerInner {
    config: SessionConfig,
    sessions: DashMap<SessionId, Session>,
    /// Live session per client, for reconnect resolution.
    client_index: DashMap<ClientId, SessionId>,
    mux: Arc<ResourceMultiplexer>,
    /// Per-session delivery sinks for connected clients.
    deliveries: DashMap<SessionId, mpsc::UnboundedSender<PublishRequest>>,
    /// Global session-expiry listeners.
    listeners: StdMutex<HashMap<u64, mpsc::UnboundedSender<SessionId>>>,
    next_listener: AtomicU64,
    publish_correlation: AtomicU64,
}

/// Owns the table of live sessions and enforces their invariants.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(config: SessionConfig, mux: Arc<ResourceMultiplexer>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                sessions: DashMap::new(),
                client_index: DashMap::new(),
                mux,
                deliveries: DashMap::new(),
                listeners: StdMutex::new(HashMap::new()),
                next_listener: AtomicU64::new(1),
                publish_correlation: AtomicU64::new(1),
            }),
        }
    }

    pub fn multiplexer(&self) -> &Arc<ResourceMultiplexer> {
        &self.inner.mux
    }

    /// Current state of a session, if it exists.
    pub fn session_state(&self, session_id: SessionId) -> Option<SessionState> {
        self.inner.sessions.get(&session_id).map(|s| s.state)
    }

    /// Register a global listener notified of every session expiry.
    /// Dropping the handle removes the listener.
    pub fn listen_expiry(&self) -> ExpiryListener {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .expect("listener lock poisoned")
            .insert(id, tx);
        ExpiryListener {
            id,
            rx,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Attach a connection to a session's event stream.
    ///
    /// Pending (unacknowledged) events are replayed into the returned
    /// channel in order before any new event is delivered.
    pub fn attach(
        &self,
        session_id: SessionId,
    ) -> CoordResult<mpsc::UnboundedReceiver<PublishRequest>> {
        let replay: Vec<EventBatch> = {
            let mut session = self
                .inner
                .sessions
                .get_mut(&session_id)
                .ok_or(CoordError::UnknownSession(session_id))?;
            if !session.state.is_live() {
                return Err(CoordError::UnknownSession(session_id));
            }
            session.state = SessionState::Open;
            session.pending_events.iter().cloned().collect()
        };

        let (tx, rx) = mpsc::unbounded_channel();
        for batch in replay {
            let _ = tx.send(self.publish_request(session_id, batch));
        }
        self.inner.deliveries.insert(session_id, tx);
        debug!(session = %session_id, "Connection attached");
        Ok(rx)
    }

    /// Attach a reconnecting client to its live session, if it still has
    /// one.
    pub fn resume(
        &self,
        client_id: ClientId,
    ) -> CoordResult<(SessionId, mpsc::UnboundedReceiver<PublishRequest>)> {
        let session_id = self
            .inner
            .client_index
            .get(&client_id)
            .map(|entry| *entry.value())
            .ok_or(CoordError::UnknownSession(SessionId::NONE))?;
        let rx = self.attach(session_id)?;
        Ok((session_id, rx))
    }

    /// Detach a connection; the session survives and buffers events.
    pub fn detach(&self, session_id: SessionId) {
        self.inner.deliveries.remove(&session_id);
        if let Some(mut session) = self.inner.sessions.get_mut(&session_id) {
            if session.state == SessionState::Open {
                session.state = SessionState::Suspended;
            }
        }
    }

    /// Handle a client's Publish acknowledgement.
    pub fn acknowledge_events(&self, session_id: SessionId, ack: EventIndex) -> CoordResult<()> {
        let mut session = self
            .inner
            .sessions
            .get_mut(&session_id)
            .ok_or(CoordError::UnknownSession(session_id))?;
        if !session.state.is_live() {
            return Err(CoordError::UnknownSession(session_id));
        }
        session.release_events(ack);
        Ok(())
    }

    /// Execute a query for a session at the given consistency.
    ///
    /// The caller has already obtained a read index from the log layer;
    /// this routes the query and returns the session's event index
    /// alongside the result bytes.
    pub async fn query(
        &self,
        session_id: SessionId,
        sequence: Sequence,
        resource_id: ResourceId,
        payload: Vec<u8>,
        consistency: Consistency,
        deadline: Option<Duration>,
    ) -> CoordResult<(EventIndex, Vec<u8>)> {
        let deadline = tokio::time::Instant::now() + deadline.unwrap_or(DEFAULT_QUERY_DEADLINE);

        if consistency == Consistency::Causal {
            // Wait until this session's applied commands cover everything
            // the query causally depends on.
            loop {
                let caught_up = {
                    let session = self
                        .inner
                        .sessions
                        .get(&session_id)
                        .ok_or(CoordError::UnknownSession(session_id))?;
                    if !session.state.is_live() {
                        return Err(CoordError::UnknownSession(session_id));
                    }
                    session.command_sequence.value() + 1 >= sequence.value()
                };
                if caught_up {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(CoordError::Timeout);
                }
                tokio::time::sleep(QUERY_POLL_INTERVAL).await;
            }
        } else {
            let session = self
                .inner
                .sessions
                .get(&session_id)
                .ok_or(CoordError::UnknownSession(session_id))?;
            if !session.state.is_live() {
                return Err(CoordError::UnknownSession(session_id));
            }
        }

        let result = tokio::time::timeout_at(
            deadline,
            self.inner
                .mux
                .dispatch_query(session_id, resource_id, payload, consistency),
        )
        .await
        .map_err(|_| CoordError::Timeout)??;

        let event_index = self
            .inner
            .sessions
            .get(&session_id)
            .map(|session| session.event_index)
            .unwrap_or(EventIndex::ZERO);
        Ok((event_index, result))
    }

    // ------------------------------------------------------------------
    // Apply path (serialized by the log layer)
    // ------------------------------------------------------------------

    async fn apply_register(
        &self,
        client_id: ClientId,
        timeout_ms: u64,
        now_ms: u64,
        index: CommitIndex,
    ) -> ApplyResult {
        let session_id = SessionId::new(index.value());
        // Brand-new clients get the register index as their stable id,
        // which is deterministic across replicas.
        let client_id = if client_id.is_assigned() {
            client_id
        } else {
            ClientId::new(index.value())
        };
        let timeout_ms = if timeout_ms == 0 {
            self.inner.config.session_timeout.as_millis() as u64
        } else {
            timeout_ms
        };

        self.inner.sessions.insert(
            session_id,
            Session::new(session_id, client_id, timeout_ms, now_ms, index),
        );
        self.inner.client_index.insert(client_id, session_id);

        info!(session = %session_id, client = %client_id, timeout_ms, "Session registered");
        ApplyResult::Registered {
            session_id,
            timeout_ms,
        }
    }

    fn apply_keep_alive(
        &self,
        session_id: SessionId,
        command_ack: Sequence,
        event_ack: EventIndex,
        now_ms: u64,
        index: CommitIndex,
    ) -> CoordResult<()> {
        let mut session = self
            .inner
            .sessions
            .get_mut(&session_id)
            .ok_or(CoordError::UnknownSession(session_id))?;
        if !session.state.is_live() {
            return Err(CoordError::UnknownSession(session_id));
        }

        session.last_keepalive_ms = now_ms;
        session.last_keepalive_index = index;
        session.release_events(event_ack);
        session.trim_result_cache(command_ack);
        Ok(())
    }

    async fn apply_command(
        &self,
        session_id: SessionId,
        sequence: Sequence,
        resource_id: ResourceId,
        type_id: TypeId,
        payload: Vec<u8>,
        index: CommitIndex,
    ) -> CommandCompletion {
        enum Disposition {
            Reject(CoordError),
            Replay(CommandOutcome),
            Apply,
            Queue,
        }

        let (tx, rx) = oneshot::channel();

        let disposition = {
            match self.inner.sessions.get_mut(&session_id) {
                None => Disposition::Reject(CoordError::UnknownSession(session_id)),
                Some(session) if !session.state.is_live() => {
                    Disposition::Reject(CoordError::UnknownSession(session_id))
                }
                Some(session) => {
                    if sequence <= session.command_sequence {
                        match session.result_cache.get(&sequence.value()) {
                            Some(cached) => Disposition::Replay(CommandOutcome {
                                index: cached.index,
                                event_index: cached.event_index,
                                result: cached.outcome.to_result(),
                            }),
                            None => Disposition::Reject(CoordError::CommandFailure(format!(
                                "sequence {sequence} is below the duplicate-suppression horizon"
                            ))),
                        }
                    } else if sequence == session.command_sequence.next() {
                        Disposition::Apply
                    } else {
                        Disposition::Queue
                    }
                }
            }
        };

        match disposition {
            Disposition::Reject(error) => {
                let _ = tx.send(CommandOutcome {
                    index,
                    event_index: EventIndex::ZERO,
                    result: Err(error),
                });
            }
            Disposition::Replay(outcome) => {
                debug!(session = %session_id, %sequence, "Replayed cached command result");
                let _ = tx.send(outcome);
            }
            Disposition::Queue => {
                if let Some(mut session) = self.inner.sessions.get_mut(&session_id) {
                    debug!(
                        session = %session_id,
                        %sequence,
                        expected = %session.command_sequence.next(),
                        "Command queued on sequence gap"
                    );
                    session.gap_queue.insert(
                        sequence.value(),
                        PendingCommand {
                            entry_index: index,
                            enqueued_index: index,
                            resource_id,
                            type_id,
                            payload,
                            completion: tx,
                        },
                    );
                }
            }
            Disposition::Apply => {
                let outcome = self
                    .apply_in_order(session_id, sequence, resource_id, type_id, payload, index)
                    .await;
                let _ = tx.send(outcome);
                self.drain_gap_queue(session_id).await;
            }
        }

        rx
    }

    /// Apply the next in-order command: open the resource if needed,
    /// dispatch, publish events, cache the result, advance the sequence.
    async fn apply_in_order(
        &self,
        session_id: SessionId,
        sequence: Sequence,
        resource_id: ResourceId,
        type_id: TypeId,
        payload: Vec<u8>,
        index: CommitIndex,
    ) -> CommandOutcome {
        let result = match self.inner.mux.open(session_id, resource_id, type_id).await {
            Ok(open_events) => {
                if let Some(mut session) = self.inner.sessions.get_mut(&session_id) {
                    session.resources.insert(resource_id);
                }
                let overflow = self.publish_events(open_events);
                self.expire_overflowed(overflow).await;

                match self
                    .inner
                    .mux
                    .dispatch_command(session_id, resource_id, index, payload)
                    .await
                {
                    Ok(dispatch) => {
                        let overflow = self.publish_events(dispatch.events);
                        self.expire_overflowed(overflow).await;
                        dispatch.result
                    }
                    Err(error) => Err(error),
                }
            }
            Err(error) => Err(error),
        };

        // The entry is consumed even on failure; re-application would
        // violate determinism, so the outcome is cached and the sequence
        // advances regardless.
        let event_index = {
            match self.inner.sessions.get_mut(&session_id) {
                Some(mut session) => {
                    session.command_sequence = sequence;
                    let event_index = session.event_index;
                    session.result_cache.insert(
                        sequence.value(),
                        CachedResult {
                            index,
                            event_index,
                            outcome: CachedOutcome::from_result(&result),
                        },
                    );
                    event_index
                }
                None => EventIndex::ZERO,
            }
        };

        CommandOutcome {
            index,
            event_index,
            result,
        }
    }

    /// Apply queued commands that have become contiguous.
    async fn drain_gap_queue(&self, session_id: SessionId) {
        loop {
            let next = {
                match self.inner.sessions.get_mut(&session_id) {
                    Some(mut session) => {
                        let want = session.command_sequence.next();
                        session
                            .gap_queue
                            .remove(&want.value())
                            .map(|pending| (want, pending))
                    }
                    None => None,
                }
            };

            let Some((sequence, pending)) = next else {
                return;
            };

            let outcome = self
                .apply_in_order(
                    session_id,
                    sequence,
                    pending.resource_id,
                    pending.type_id,
                    pending.payload,
                    pending.entry_index,
                )
                .await;
            let _ = pending.completion.send(outcome);
        }
    }

    async fn apply_unregister(&self, session_id: SessionId) -> CoordResult<()> {
        let held = self.close_session(session_id, SessionState::Closed)?;
        let events = self.inner.mux.session_closed(session_id, false, &held).await;
        let overflow = self.publish_events(events);
        self.expire_overflowed(overflow).await;
        info!(session = %session_id, "Session unregistered");
        Ok(())
    }

    /// Expire a session: release its resources, notify surviving sessions'
    /// events, then tell global listeners. Nothing is published to the
    /// session afterwards.
    async fn expire(&self, session_id: SessionId, reason: ExpireReason) {
        let Ok(held) = self.close_session(session_id, SessionState::Expired) else {
            return;
        };
        warn!(session = %session_id, ?reason, "Session expired");

        let events = self.inner.mux.session_closed(session_id, true, &held).await;
        let overflow = self.publish_events(events);

        // Expiry notifications are ordered after the final publishes for
        // the sessions that survive.
        {
            let mut listeners = self.inner.listeners.lock().expect("listener lock poisoned");
            listeners.retain(|_, tx| tx.send(session_id).is_ok());
        }

        self.expire_overflowed(overflow).await;
    }

    /// Shared teardown for unregister and expire. Returns the resources
    /// the session held.
    fn close_session(
        &self,
        session_id: SessionId,
        terminal: SessionState,
    ) -> CoordResult<Vec<ResourceId>> {
        let mut session = self
            .inner
            .sessions
            .get_mut(&session_id)
            .ok_or(CoordError::UnknownSession(session_id))?;
        if !session.state.is_live() {
            return Err(CoordError::UnknownSession(session_id));
        }

        session.state = terminal;
        let held: Vec<ResourceId> = session.resources.iter().copied().collect();
        session.resources.clear();
        session.pending_events.clear();

        // Fail any commands still waiting on a gap.
        let gap_error = match terminal {
            SessionState::Expired => CoordError::SequenceGap {
                session_id,
                missing: session.command_sequence.next().value(),
            },
            _ => CoordError::UnknownSession(session_id),
        };
        for (_, pending) in std::mem::take(&mut session.gap_queue) {
            let _ = pending.completion.send(CommandOutcome {
                index: pending.entry_index,
                event_index: EventIndex::ZERO,
                result: Err(gap_error.clone()),
            });
        }

        let client_id = session.client_id;
        drop(session);

        self.inner.deliveries.remove(&session_id);
        self.inner
            .client_index
            .remove_if(&client_id, |_, mapped| *mapped == session_id);
        Ok(held)
    }

    /// Expire sessions whose keep-alives lapsed or whose sequence gap
    /// outlived the commit threshold. Runs before every entry applies, on
    /// the entry's own timestamp and index.
    async fn sweep(&self, now_ms: u64, index: CommitIndex) {
        let threshold = self.inner.config.command_gap_threshold;
        let mut stale: Vec<(SessionId, ExpireReason)> = Vec::new();

        for entry in self.inner.sessions.iter() {
            let session = entry.value();
            if !session.state.is_live() {
                continue;
            }
            if now_ms.saturating_sub(session.last_keepalive_ms) > session.timeout_ms {
                stale.push((session.session_id, ExpireReason::Timeout));
            } else if let Some(opened) = session.gap_opened_at() {
                if index.value().saturating_sub(opened.value()) > threshold {
                    stale.push((
                        session.session_id,
                        ExpireReason::SequenceGap {
                            missing: session.command_sequence.next().value(),
                        },
                    ));
                }
            }
        }

        for (session_id, reason) in stale {
            self.expire(session_id, reason).await;
        }
    }

    // ------------------------------------------------------------------
    // Event publication
    // ------------------------------------------------------------------

    /// Assign event indices and enqueue the events on their target
    /// sessions, attempting immediate delivery. Returns sessions whose
    /// pending buffer overflowed.
    fn publish_events(&self, events: Vec<SessionEvent>) -> Vec<SessionId> {
        let mut overflowed = Vec::new();

        for event in events {
            let target = event.session_id;
            let batch = {
                let Some(mut session) = self.inner.sessions.get_mut(&target) else {
                    continue;
                };
                if !session.state.is_live() {
                    continue;
                }

                let previous = session.event_index;
                let assigned = previous.next();
                session.event_index = assigned;
                let batch = EventBatch {
                    previous_index: previous,
                    event_index: assigned,
                    events: vec![Event {
                        resource_id: event.event.resource_id,
                        event_index: assigned,
                        payload: event.event.payload,
                    }],
                };
                session.pending_events.push_back(batch.clone());
                if session.pending_events.len() > self.inner.config.event_buffer_bound
                    && !overflowed.contains(&target)
                {
                    overflowed.push(target);
                }
                batch
            };

            if let Some(delivery) = self.inner.deliveries.get(&target) {
                let _ = delivery.send(self.publish_request(target, batch));
            }
        }

        overflowed
    }

    async fn expire_overflowed(&self, overflowed: Vec<SessionId>) {
        for session_id in overflowed {
            self.expire_boxed(session_id, ExpireReason::EventOverflow)
                .await;
        }
    }

    /// Boxed indirection to keep the expire/publish recursion finite in
    /// the type system.
    fn expire_boxed(
        &self,
        session_id: SessionId,
        reason: ExpireReason,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(self.expire(session_id, reason))
    }

    fn publish_request(&self, session_id: SessionId, batch: EventBatch) -> PublishRequest {
        PublishRequest {
            id: CorrelationId::new(
                self.inner.publish_correlation.fetch_add(1, Ordering::Relaxed),
            ),
            session_id,
            event_index: batch.event_index,
            previous_index: batch.previous_index,
            events: batch.events,
        }
    }
}

#[async_trait]
impl LogApplier for SessionManager {
    async fn apply(&self, committed: Committed) -> ApplyResult {
        let now_ms = committed.timestamp_ms;
        let index = committed.index;

        self.sweep(now_ms, index).await;

        match committed.entry {
            LogEntry::Noop => ApplyResult::None,
            LogEntry::Register {
                client_id,
                timeout_ms,
            } => self.apply_register(client_id, timeout_ms, now_ms, index).await,
            LogEntry::KeepAlive {
                session_id,
                command_sequence_ack,
                event_index_ack,
            } => ApplyResult::KeepAlive(self.apply_keep_alive(
                session_id,
                command_sequence_ack,
                event_index_ack,
                now_ms,
                index,
            )),
            LogEntry::Command {
                session_id,
                sequence,
                resource_id,
                type_id,
                payload,
            } => ApplyResult::Command(
                self.apply_command(session_id, sequence, resource_id, type_id, payload, index)
                    .await,
            ),
            LogEntry::Unregister { session_id } => {
                ApplyResult::Unregistered(self.apply_unregister(session_id).await)
            }
        }
    }

    async fn snapshot(&self) -> CoordResult<Vec<u8>> {
        let mut sessions: Vec<SessionSnapshot> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().to_snapshot())
            .collect();
        sessions.sort_by_key(|s| s.session_id);

        let mut clients: Vec<(ClientId, SessionId)> = self
            .inner
            .client_index
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        clients.sort();

        let machines = self.inner.mux.snapshot_all().await?;

        bincode::serialize(&StateCapture {
            sessions,
            clients,
            machines,
        })
        .map_err(|e| CoordError::Internal(format!("snapshot encoding failed: {e}")))
    }

    async fn restore(&self, data: &[u8]) -> CoordResult<()> {
        let capture: StateCapture = bincode::deserialize(data)
            .map_err(|e| CoordError::Internal(format!("snapshot decoding failed: {e}")))?;

        self.inner.sessions.clear();
        self.inner.client_index.clear();
        self.inner.deliveries.clear();

        for snapshot in capture.sessions {
            let session = Session::from_snapshot(snapshot);
            self.inner.sessions.insert(session.session_id, session);
        }
        for (client_id, session_id) in capture.clients {
            self.inner.client_index.insert(client_id, session_id);
        }
        self.inner.mux.restore_all(capture.machines).await
    }

    fn lowest_pinned_index(&self) -> Option<CommitIndex> {
        self.inner
            .sessions
            .iter()
            .filter_map(|entry| entry.value().lowest_pinned())
            .min()
    }
}

/// Handle for a global expiry listener; dropping it removes the listener.
pub struct ExpiryListener {
    id: u64,
    rx: mpsc::UnboundedReceiver<SessionId>,
    inner: Weak<ManagerInner>,
}

impl ExpiryListener {
    /// The next expired session, or `None` if the manager is gone.
    pub async fn recv(&mut self) -> Option<SessionId> {
        self.rx.recv().await
    }

    /// Non-blocking poll for an expired session.
    pub fn try_recv(&mut self) -> Option<SessionId> {
        self.rx.try_recv().ok()
    }
}

impl Drop for ExpiryListener {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner
                .listeners
                .lock()
                .expect("listener lock poisoned")
                .remove(&self.id);
        }
    }
}
