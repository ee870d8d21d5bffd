//! Reference-counted pooled byte buffers with reader and writer views.
//!
//! The pool amortizes allocation of transient I/O buffers across a
//! high-traffic server: request payloads, log entry bodies, and snapshot
//! bytes all flow through [`Buffer`]s acquired here. Instead of explicit
//! acquire/release calls, every handle ([`Buffer`], [`BufferReader`],
//! [`BufferWriter`]) holds a reference count and releases it on drop; when
//! the last handle drops, the underlying storage returns to its pool in a
//! reset state (cursors and length zeroed, byte contents not zeroed —
//! callers must not rely on residual contents).
//!
//! A bounded pool blocks `acquire()` until a buffer frees up;
//! `try_acquire()` fails with `ResourceExhausted` instead.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::constants::{DEFAULT_BUFFER_CAPACITY, MAX_POOLED_BUFFER_SIZE};
use crate::error::{Error, Result};

/// Buffer pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum buffers checked out at once (0 = unbounded).
    pub capacity: usize,
    /// Initial byte capacity of freshly allocated buffers.
    pub buffer_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 0,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

/// Number of idle storages an unbounded pool retains.
const UNBOUNDED_IDLE_LIMIT: usize = 64;

struct PoolShared {
    free: Mutex<Vec<Vec<u8>>>,
    permits: Option<Arc<Semaphore>>,
    capacity: usize,
    buffer_capacity: usize,
}

impl PoolShared {
    fn idle_limit(&self) -> usize {
        if self.capacity == 0 {
            UNBOUNDED_IDLE_LIMIT
        } else {
            self.capacity
        }
    }

    fn recycle(&self, mut storage: Vec<u8>) {
        // Oversized storages are dropped rather than pooled.
        if storage.capacity() > MAX_POOLED_BUFFER_SIZE {
            return;
        }
        storage.clear();
        let mut free = self.free.lock().expect("buffer pool lock poisoned");
        if free.len() < self.idle_limit() {
            free.push(storage);
        }
    }
}

/// A pool of reusable, reference-counted byte buffers.
///
/// Cloning the pool is cheap; clones share the same free list and bound.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    pub fn new(config: PoolConfig) -> Self {
        let permits = if config.capacity > 0 {
            Some(Arc::new(Semaphore::new(config.capacity)))
        } else {
            None
        };
        Self {
            shared: Arc::new(PoolShared {
                free: Mutex::new(Vec::new()),
                permits,
                capacity: config.capacity,
                buffer_capacity: config.buffer_capacity.max(1),
            }),
        }
    }

    /// Acquire a buffer with reference count 1, blocking while a bounded
    /// pool is exhausted.
    pub async fn acquire(&self) -> Buffer {
        let permit = match &self.shared.permits {
            Some(sem) => Some(
                sem.clone()
                    .acquire_owned()
                    .await
                    .expect("buffer pool semaphore closed"),
            ),
            None => None,
        };
        self.checkout(permit)
    }

    /// Acquire a buffer without blocking.
    ///
    /// Fails with [`Error::ResourceExhausted`] when a bounded pool has no
    /// capacity left.
    pub fn try_acquire(&self) -> Result<Buffer> {
        let permit = match &self.shared.permits {
            Some(sem) => match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    return Err(Error::ResourceExhausted {
                        capacity: self.shared.capacity,
                    });
                }
            },
            None => None,
        };
        Ok(self.checkout(permit))
    }

    /// Number of idle storages currently held by the pool.
    pub fn idle(&self) -> usize {
        self.shared.free.lock().expect("buffer pool lock poisoned").len()
    }

    fn checkout(&self, permit: Option<OwnedSemaphorePermit>) -> Buffer {
        let storage = {
            let mut free = self.shared.free.lock().expect("buffer pool lock poisoned");
            free.pop()
        }
        .unwrap_or_else(|| Vec::with_capacity(self.shared.buffer_capacity));

        Buffer {
            inner: Arc::new(BufferInner {
                state: Mutex::new(BufferState { storage, permit }),
                refs: AtomicUsize::new(1),
                shared_mode: AtomicBool::new(false),
                pool: Arc::downgrade(&self.shared),
            }),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

struct BufferState {
    storage: Vec<u8>,
    permit: Option<OwnedSemaphorePermit>,
}

struct BufferInner {
    state: Mutex<BufferState>,
    refs: AtomicUsize,
    shared_mode: AtomicBool,
    pool: Weak<PoolShared>,
}

impl BufferInner {
    fn retain(self: &Arc<Self>) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    fn release(self: &Arc<Self>) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        // Last handle: reset and hand the storage back to the pool. The
        // permit drops here, unblocking a waiting acquire.
        let mut state = self.state.lock().expect("buffer lock poisoned");
        let storage = std::mem::take(&mut state.storage);
        state.permit = None;
        drop(state);
        if let Some(pool) = self.pool.upgrade() {
            pool.recycle(storage);
        }
    }
}

/// A reference-counted byte buffer with independent read and write cursors.
///
/// The write cursor is the end of the committed contents; the read cursor
/// belongs to the buffer and is advanced by [`Buffer::read`]-style calls on
/// readers. Dropping the last handle (buffer, reader, or writer) returns the
/// storage to its pool.
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl Buffer {
    /// A buffer not backed by any pool; its storage is dropped on release.
    ///
    /// Used where pooling has no benefit, e.g. snapshot capture.
    pub fn detached() -> Self {
        Buffer {
            inner: Arc::new(BufferInner {
                state: Mutex::new(BufferState {
                    storage: Vec::new(),
                    permit: None,
                }),
                refs: AtomicUsize::new(1),
                shared_mode: AtomicBool::new(false),
                pool: Weak::new(),
            }),
        }
    }

    /// Mark the buffer shared: concurrent readers may observe appends from a
    /// single writer. Non-shared buffers assume the caller serializes writes
    /// against reads.
    pub fn set_shared(&self, shared: bool) -> &Self {
        self.inner.shared_mode.store(shared, Ordering::Relaxed);
        self
    }

    pub fn is_shared(&self) -> bool {
        self.inner.shared_mode.load(Ordering::Relaxed)
    }

    /// Committed length in bytes.
    pub fn len(&self) -> usize {
        self.inner.state.lock().expect("buffer lock poisoned").storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current reference count (buffer + live views).
    pub fn refs(&self) -> usize {
        self.inner.refs.load(Ordering::Relaxed)
    }

    /// Copy of the committed contents.
    pub fn contents(&self) -> Vec<u8> {
        self.inner
            .state
            .lock()
            .expect("buffer lock poisoned")
            .storage
            .clone()
    }

    /// Acquire a reader view; increments the reference count.
    pub fn reader(&self) -> BufferReader {
        self.inner.retain();
        BufferReader {
            inner: self.inner.clone(),
            pos: 0,
        }
    }

    /// Acquire a writer view; increments the reference count.
    pub fn writer(&self) -> BufferWriter {
        self.inner.retain();
        BufferWriter {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.inner.release();
    }
}

/// A read view over a buffer, with its own cursor.
///
/// Reads never observe bytes beyond the committed write position at the time
/// of the call.
pub struct BufferReader {
    inner: Arc<BufferInner>,
    pos: usize,
}

impl BufferReader {
    /// Bytes remaining between the cursor and the committed length.
    pub fn remaining(&self) -> usize {
        let state = self.inner.state.lock().expect("buffer lock poisoned");
        state.storage.len().saturating_sub(self.pos)
    }

    /// Read up to `dst.len()` bytes, advancing the cursor. Returns the
    /// number of bytes read.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let state = self.inner.state.lock().expect("buffer lock poisoned");
        let available = state.storage.len().saturating_sub(self.pos);
        let n = available.min(dst.len());
        dst[..n].copy_from_slice(&state.storage[self.pos..self.pos + n]);
        drop(state);
        self.pos += n;
        n
    }

    /// Read exactly `dst.len()` bytes or fail without advancing.
    pub fn read_exact(&mut self, dst: &mut [u8]) -> Result<()> {
        let state = self.inner.state.lock().expect("buffer lock poisoned");
        let available = state.storage.len().saturating_sub(self.pos);
        if available < dst.len() {
            return Err(Error::MissingData(format!(
                "buffer read of {} bytes with {} available",
                dst.len(),
                available
            )));
        }
        dst.copy_from_slice(&state.storage[self.pos..self.pos + dst.len()]);
        drop(state);
        self.pos += dst.len();
        Ok(())
    }

    /// Read a big-endian u64.
    pub fn read_u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        self.read_exact(&mut raw)?;
        Ok(u64::from_be_bytes(raw))
    }

    /// Read all remaining bytes.
    pub fn read_to_end(&mut self) -> Vec<u8> {
        let state = self.inner.state.lock().expect("buffer lock poisoned");
        let out = state.storage[self.pos.min(state.storage.len())..].to_vec();
        drop(state);
        self.pos += out.len();
        out
    }
}

impl Drop for BufferReader {
    fn drop(&mut self) {
        self.inner.release();
    }
}

/// A write view over a buffer.
///
/// Writes append at the committed write position, extending the length. On a
/// shared buffer the extension is atomic with respect to concurrent readers;
/// otherwise the caller guarantees exclusive write access.
pub struct BufferWriter {
    inner: Arc<BufferInner>,
}

impl BufferWriter {
    /// Append bytes at the write cursor.
    pub fn write_all(&mut self, src: &[u8]) {
        let mut state = self.inner.state.lock().expect("buffer lock poisoned");
        state.storage.extend_from_slice(src);
    }

    /// Append a big-endian u64.
    pub fn write_u64(&mut self, value: u64) {
        self.write_all(&value.to_be_bytes());
    }

    /// Committed length after all writes so far.
    pub fn position(&self) -> usize {
        self.inner.state.lock().expect("buffer lock poisoned").storage.len()
    }
}

impl Drop for BufferWriter {
    fn drop(&mut self) {
        self.inner.release();
    }
}
