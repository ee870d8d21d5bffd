//! In-process replicated log.
//!
//! `LocalLog` implements [`ReplicatedLog`] for a single replica: entries are
//! assigned contiguous commit indices, applied in strict commit order (one
//! in flight), and compacted according to state-machine watermarks and
//! session result-cache pins. Snapshots are persisted to an object store
//! with a two-phase temp-then-rename commit so a crash mid-write never
//! leaves a half-visible snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use moka::sync::Cache;
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

use super::{
    ApplyResult, Clock, Committed, CompactionTracker, LogApplier, LogEntry, ReplicatedLog,
    SystemClock,
};
use crate::constants::DEFAULT_LINEARIZABLE_LEASE_MS;
use crate::error::{CoordError, CoordResult};
use crate::protocol::Consistency;
use crate::types::{CommitIndex, ResourceId};

/// How many appends may pass between opportunistic compaction sweeps.
const COMPACTION_SWEEP_INTERVAL: u64 = 64;

/// Snapshot metadata stored alongside the snapshot data.
#[derive(Clone, Serialize, Deserialize)]
struct SnapshotMetadata {
    /// The last commit index included in this snapshot.
    last_index: u64,
    /// The term at the time of the snapshot.
    term: u64,
    /// Unique identifier for this snapshot.
    snapshot_id: String,
}

/// Configuration for a [`LocalLog`].
#[derive(Debug, Clone)]
pub struct LocalLogOptions {
    /// How long a confirmed leadership observation serves
    /// bounded-linearizable reads.
    pub linearizable_lease: Duration,
    /// Path prefix for snapshots in the object store.
    pub snapshot_prefix: String,
}

impl Default for LocalLogOptions {
    fn default() -> Self {
        Self {
            linearizable_lease: Duration::from_millis(DEFAULT_LINEARIZABLE_LEASE_MS),
            snapshot_prefix: "concord/snapshots".to_string(),
        }
    }
}

/// A single-replica implementation of [`ReplicatedLog`].
pub struct LocalLog {
    /// Serializes append-then-apply so entries reach the applier in commit
    /// order with one in flight.
    apply_gate: Mutex<()>,
    entries: RwLock<BTreeMap<u64, Committed>>,
    next_index: AtomicU64,
    term: AtomicU64,
    last_purged: AtomicU64,
    appends_since_sweep: AtomicU64,
    applier: Arc<dyn LogApplier>,
    tracker: Arc<CompactionTracker>,
    is_leader: AtomicBool,
    leader_hint: std::sync::RwLock<Option<String>>,
    /// Presence of the key means a leadership confirmation is still within
    /// the lease window.
    lease: Cache<u8, u64>,
    clock: Arc<dyn Clock>,
    object_store: Arc<dyn ObjectStore>,
    snapshot_path: ObjectPath,
}

impl LocalLog {
    pub fn new(
        applier: Arc<dyn LogApplier>,
        tracker: Arc<CompactionTracker>,
        object_store: Arc<dyn ObjectStore>,
        options: LocalLogOptions,
    ) -> Self {
        Self::with_clock(applier, tracker, object_store, options, Arc::new(SystemClock))
    }

    pub fn with_clock(
        applier: Arc<dyn LogApplier>,
        tracker: Arc<CompactionTracker>,
        object_store: Arc<dyn ObjectStore>,
        options: LocalLogOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let lease = Cache::builder()
            .time_to_live(options.linearizable_lease)
            .max_capacity(1)
            .build();

        Self {
            apply_gate: Mutex::new(()),
            entries: RwLock::new(BTreeMap::new()),
            next_index: AtomicU64::new(0),
            term: AtomicU64::new(1),
            last_purged: AtomicU64::new(0),
            appends_since_sweep: AtomicU64::new(0),
            applier,
            tracker,
            is_leader: AtomicBool::new(true),
            leader_hint: std::sync::RwLock::new(None),
            lease,
            clock,
            object_store,
            snapshot_path: ObjectPath::from(options.snapshot_prefix.as_str()),
        }
    }

    /// Whether this replica currently considers itself the leader.
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Change this replica's leadership state, optionally recording where
    /// the leadership went. Losing leadership invalidates the read lease.
    pub fn set_leader(&self, is_leader: bool, hint: Option<String>) {
        self.is_leader.store(is_leader, Ordering::SeqCst);
        *self.leader_hint.write().expect("leader hint lock poisoned") = hint;
        if !is_leader {
            self.lease.invalidate(&0);
        }
    }

    /// Number of entries currently retained (after compaction).
    pub async fn retained_entries(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Index up to which the log has been purged.
    pub fn purged_index(&self) -> CommitIndex {
        CommitIndex::new(self.last_purged.load(Ordering::SeqCst))
    }

    /// Load the latest snapshot from the object store, if one exists.
    ///
    /// Returns `Ok(true)` when a snapshot was restored, `Ok(false)` on a
    /// clean start. A snapshot that exists but cannot be read or decoded is
    /// corruption and fails startup. Orphaned temp files from crashed
    /// snapshot writes are cleaned up first; they are never referenced by a
    /// valid snapshot.
    pub async fn restore_from_store(&self) -> CoordResult<bool> {
        self.cleanup_temp_files().await;

        let meta_path = self.meta_path();
        let data_path = self.data_path();

        let meta_bytes = match self.object_store.get(&meta_path).await {
            Ok(result) => result
                .bytes()
                .await
                .map_err(|e| corruption("snapshot metadata unreadable", e))?,
            Err(object_store::Error::NotFound { .. }) => {
                debug!("No existing snapshot found (clean start)");
                return Ok(false);
            }
            Err(e) => return Err(corruption("snapshot metadata inaccessible", e)),
        };

        let metadata: SnapshotMetadata = bincode::deserialize(&meta_bytes)
            .map_err(|e| corruption("snapshot metadata corrupted", e))?;

        let data_bytes = match self.object_store.get(&data_path).await {
            Ok(result) => result
                .bytes()
                .await
                .map_err(|e| corruption("snapshot data unreadable", e))?,
            Err(object_store::Error::NotFound { .. }) => {
                error!(
                    snapshot_id = %metadata.snapshot_id,
                    "Snapshot metadata exists but data file is missing"
                );
                return Err(CoordError::Internal(
                    "snapshot metadata exists but data file is missing".to_string(),
                ));
            }
            Err(e) => return Err(corruption("snapshot data inaccessible", e)),
        };

        self.applier.restore(&data_bytes).await?;
        self.next_index.store(metadata.last_index, Ordering::SeqCst);
        self.last_purged.store(metadata.last_index, Ordering::SeqCst);
        self.term.store(metadata.term, Ordering::SeqCst);

        info!(
            snapshot_id = %metadata.snapshot_id,
            last_index = metadata.last_index,
            "Restored snapshot from object store"
        );
        Ok(true)
    }

    /// Drop log positions no machine or result cache still needs.
    pub async fn compact(&self) {
        let Some(floor) = self.tracker.release_floor() else {
            return;
        };

        // Result caches pin the entry that produced each retained result.
        let droppable = match self.applier.lowest_pinned_index() {
            Some(pin) => floor.value().min(pin.value().saturating_sub(1)),
            None => floor.value(),
        };

        if droppable == 0 {
            return;
        }

        let mut entries = self.entries.write().await;
        let keys: Vec<u64> = entries.range(..=droppable).map(|(k, _)| *k).collect();
        let removed = keys.len();
        for key in keys {
            entries.remove(&key);
        }
        drop(entries);

        if removed > 0 {
            let prev = self.last_purged.load(Ordering::SeqCst);
            self.last_purged.store(prev.max(droppable), Ordering::SeqCst);
            debug!(up_to = droppable, removed, "Compacted log");
        }
    }

    /// Best-effort removal of `temp-*.snapshot` / `temp-*.meta` leftovers.
    async fn cleanup_temp_files(&self) {
        use futures::StreamExt;

        let mut listing = self.object_store.list(Some(&self.snapshot_path));
        let mut orphans: Vec<ObjectPath> = Vec::new();
        while let Some(result) = listing.next().await {
            match result {
                Ok(meta) => {
                    let path = meta.location.to_string();
                    if path.contains("/temp-")
                        && (path.ends_with(".snapshot") || path.ends_with(".meta"))
                    {
                        orphans.push(meta.location);
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Error listing snapshot files during cleanup");
                }
            }
        }

        for path in orphans {
            match self.object_store.delete(&path).await {
                Ok(()) => info!(path = %path, "Removed orphaned temp snapshot file"),
                Err(e) => debug!(error = %e, path = %path, "Failed to delete temp file"),
            }
        }
    }

    fn meta_path(&self) -> ObjectPath {
        ObjectPath::from(format!("{}/current.meta", self.snapshot_path))
    }

    fn data_path(&self) -> ObjectPath {
        ObjectPath::from(format!("{}/current.snapshot", self.snapshot_path))
    }

    /// Persist a snapshot with a two-phase commit: data and metadata are
    /// written to temp paths first, then moved into place (data before
    /// metadata, so the metadata file is the commit marker).
    async fn persist_snapshot(&self, meta: &SnapshotMetadata, data: &[u8]) -> CoordResult<()> {
        let temp_data = ObjectPath::from(format!(
            "{}/temp-{}.snapshot",
            self.snapshot_path, meta.snapshot_id
        ));
        let temp_meta = ObjectPath::from(format!(
            "{}/temp-{}.meta",
            self.snapshot_path, meta.snapshot_id
        ));

        let meta_bytes =
            bincode::serialize(meta).map_err(|e| CoordError::Internal(e.to_string()))?;

        self.object_store
            .put(&temp_data, Bytes::copy_from_slice(data).into())
            .await
            .map_err(|e| CoordError::Internal(format!("snapshot data write failed: {e}")))?;

        if let Err(e) = self
            .object_store
            .put(&temp_meta, Bytes::copy_from_slice(&meta_bytes).into())
            .await
        {
            let _ = self.object_store.delete(&temp_data).await;
            return Err(CoordError::Internal(format!(
                "snapshot metadata write failed: {e}"
            )));
        }

        self.promote(&temp_data, &self.data_path()).await?;
        self.promote(&temp_meta, &self.meta_path()).await?;

        info!(
            snapshot_id = %meta.snapshot_id,
            last_index = meta.last_index,
            size_bytes = data.len(),
            "Persisted snapshot to object store"
        );
        Ok(())
    }

    /// Move a temp object into its final location, falling back to
    /// copy+delete on backends without native rename.
    async fn promote(&self, from: &ObjectPath, to: &ObjectPath) -> CoordResult<()> {
        if self.object_store.rename(from, to).await.is_ok() {
            return Ok(());
        }
        if let Err(e) = self.object_store.copy(from, to).await {
            let _ = self.object_store.delete(from).await;
            return Err(CoordError::Internal(format!(
                "snapshot promotion failed: {e}"
            )));
        }
        let _ = self.object_store.delete(from).await;
        Ok(())
    }

    async fn confirm_leadership(&self) -> CoordResult<CommitIndex> {
        if !self.is_leader() {
            return Err(CoordError::NoLeader {
                leader: self.leader(),
            });
        }
        // Commit a barrier so the read index reflects every entry committed
        // before dispatch.
        let (index, _) = self.append(LogEntry::Noop).await?;
        self.lease.insert(0, index.value());
        Ok(index)
    }
}

#[async_trait]
impl ReplicatedLog for LocalLog {
    async fn append(&self, entry: LogEntry) -> CoordResult<(CommitIndex, ApplyResult)> {
        if !self.is_leader() {
            return Err(CoordError::NoLeader {
                leader: self.leader(),
            });
        }

        let _gate = self.apply_gate.lock().await;

        let index = CommitIndex::new(self.next_index.fetch_add(1, Ordering::SeqCst) + 1);
        let committed = Committed {
            index,
            term: self.term.load(Ordering::SeqCst),
            timestamp_ms: self.clock.now_ms(),
            entry,
        };

        self.entries
            .write()
            .await
            .insert(index.value(), committed.clone());

        let result = self.applier.apply(committed).await;

        if self.appends_since_sweep.fetch_add(1, Ordering::Relaxed) % COMPACTION_SWEEP_INTERVAL == 0
        {
            self.compact().await;
        }

        Ok((index, result))
    }

    async fn read_index(&self, consistency: Consistency) -> CoordResult<CommitIndex> {
        match consistency {
            Consistency::Causal | Consistency::Sequential => Ok(self.commit_index()),
            Consistency::Linearizable => self.confirm_leadership().await,
            Consistency::BoundedLinearizable => {
                if self.is_leader() && self.lease.get(&0).is_some() {
                    return Ok(self.commit_index());
                }
                self.confirm_leadership().await
            }
        }
    }

    async fn snapshot_now(&self) -> CoordResult<CommitIndex> {
        let data = self.applier.snapshot().await?;
        let last_index = self.commit_index();

        let meta = SnapshotMetadata {
            last_index: last_index.value(),
            term: self.term.load(Ordering::SeqCst),
            snapshot_id: format!("snapshot-{}", last_index.value()),
        };
        self.persist_snapshot(&meta, &data).await?;
        self.compact().await;
        Ok(last_index)
    }

    fn register_compaction_watermark(&self, machine: ResourceId, release_up_to: CommitIndex) {
        self.tracker.release(machine, release_up_to);
    }

    fn commit_index(&self) -> CommitIndex {
        CommitIndex::new(self.next_index.load(Ordering::SeqCst))
    }

    fn leader(&self) -> Option<String> {
        self.leader_hint
            .read()
            .expect("leader hint lock poisoned")
            .clone()
    }
}

fn corruption(context: &str, err: impl std::fmt::Display) -> CoordError {
    error!(error = %err, "{context}");
    CoordError::Internal(format!("{context}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use std::sync::Mutex as StdMutex;

    /// Applier that records the order entries arrive in.
    #[derive(Default)]
    struct RecordingApplier {
        seen: StdMutex<Vec<Committed>>,
        state: StdMutex<Vec<u8>>,
    }

    #[async_trait]
    impl LogApplier for RecordingApplier {
        async fn apply(&self, committed: Committed) -> ApplyResult {
            self.seen.lock().unwrap().push(committed);
            ApplyResult::None
        }

        async fn snapshot(&self) -> CoordResult<Vec<u8>> {
            Ok(self.state.lock().unwrap().clone())
        }

        async fn restore(&self, data: &[u8]) -> CoordResult<()> {
            *self.state.lock().unwrap() = data.to_vec();
            Ok(())
        }

        fn lowest_pinned_index(&self) -> Option<CommitIndex> {
            None
        }
    }

    fn test_log(applier: Arc<RecordingApplier>) -> LocalLog {
        LocalLog::new(
            applier,
            Arc::new(CompactionTracker::new()),
            Arc::new(InMemory::new()),
            LocalLogOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_append_assigns_contiguous_indices() {
        let applier = Arc::new(RecordingApplier::default());
        let log = test_log(applier.clone());

        for _ in 0..3 {
            log.append(LogEntry::Noop).await.unwrap();
        }

        let seen = applier.seen.lock().unwrap();
        let indices: Vec<u64> = seen.iter().map(|c| c.index.value()).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(log.commit_index(), CommitIndex::new(3));
    }

    #[tokio::test]
    async fn test_append_rejected_without_leadership() {
        let log = test_log(Arc::new(RecordingApplier::default()));
        log.set_leader(false, Some("10.0.0.9:8700".to_string()));

        let err = log.append(LogEntry::Noop).await.unwrap_err();
        assert_eq!(
            err,
            CoordError::NoLeader {
                leader: Some("10.0.0.9:8700".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_linearizable_read_commits_barrier() {
        let applier = Arc::new(RecordingApplier::default());
        let log = test_log(applier.clone());

        let index = log.read_index(Consistency::Linearizable).await.unwrap();
        assert_eq!(index, CommitIndex::new(1));
        assert!(matches!(
            applier.seen.lock().unwrap()[0].entry,
            LogEntry::Noop
        ));
    }

    #[tokio::test]
    async fn test_bounded_read_uses_lease() {
        let applier = Arc::new(RecordingApplier::default());
        let log = test_log(applier.clone());

        // First bounded read has no lease and commits a barrier.
        log.read_index(Consistency::BoundedLinearizable)
            .await
            .unwrap();
        let barriers = applier.seen.lock().unwrap().len();

        // Within the lease window no further barrier is committed.
        log.read_index(Consistency::BoundedLinearizable)
            .await
            .unwrap();
        assert_eq!(applier.seen.lock().unwrap().len(), barriers);
    }

    #[tokio::test]
    async fn test_sequential_read_never_requires_leadership() {
        let log = test_log(Arc::new(RecordingApplier::default()));
        log.set_leader(false, None);

        assert!(log.read_index(Consistency::Sequential).await.is_ok());
        assert!(log.read_index(Consistency::Causal).await.is_ok());
        assert!(log.read_index(Consistency::Linearizable).await.is_err());
    }

    #[tokio::test]
    async fn test_compaction_respects_watermarks() {
        let applier = Arc::new(RecordingApplier::default());
        let tracker = Arc::new(CompactionTracker::new());
        let log = LocalLog::new(
            applier,
            tracker.clone(),
            Arc::new(InMemory::new()),
            LocalLogOptions::default(),
        );

        let machine = ResourceId::new(1);
        tracker.track(machine);

        for _ in 0..10 {
            log.append(LogEntry::Noop).await.unwrap();
        }
        assert_eq!(log.retained_entries().await, 10);

        log.register_compaction_watermark(machine, CommitIndex::new(6));
        log.compact().await;
        assert_eq!(log.retained_entries().await, 4);
        assert_eq!(log.purged_index(), CommitIndex::new(6));
    }

    #[tokio::test]
    async fn test_snapshot_persist_and_restore() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());

        let applier = Arc::new(RecordingApplier::default());
        *applier.state.lock().unwrap() = vec![9, 9, 9];
        let log = LocalLog::new(
            applier,
            Arc::new(CompactionTracker::new()),
            store.clone(),
            LocalLogOptions::default(),
        );
        log.append(LogEntry::Noop).await.unwrap();
        log.snapshot_now().await.unwrap();

        // A fresh log over the same store restores the persisted state.
        let applier2 = Arc::new(RecordingApplier::default());
        let log2 = LocalLog::new(
            applier2.clone(),
            Arc::new(CompactionTracker::new()),
            store,
            LocalLogOptions::default(),
        );
        assert!(log2.restore_from_store().await.unwrap());
        assert_eq!(*applier2.state.lock().unwrap(), vec![9, 9, 9]);
        assert_eq!(log2.commit_index(), CommitIndex::new(1));
    }

    #[tokio::test]
    async fn test_restore_without_snapshot_is_clean_start() {
        let log = test_log(Arc::new(RecordingApplier::default()));
        assert!(!log.restore_from_store().await.unwrap());
    }
}
