//! Centralized protocol and configuration constants.
//!
//! # Categories
//!
//! - **Framing**: wire frame sizes and limits
//! - **Session**: timeouts and per-session bounds
//! - **Pool**: buffer pool sizing
//! - **Server**: connection limits and request timeouts

// =============================================================================
// Framing
// =============================================================================

/// Size of the frame length prefix in bytes (big-endian u32).
pub const FRAME_PREFIX_SIZE: usize = 4;

/// Maximum allowed frame size (16 MB).
///
/// Prevents memory exhaustion from malicious or malformed length prefixes.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// =============================================================================
// Session
// =============================================================================

/// Default session timeout in milliseconds.
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 5_000;

/// Default bound on a session's pending (unacknowledged) event buffer.
///
/// A session whose buffer exceeds this is expired; delivery of events to
/// clients that never acknowledge is not attempted beyond this window.
pub const DEFAULT_EVENT_BUFFER_BOUND: usize = 1_024;

/// Default number of commits a command sequence gap may stay open before the
/// session is expired.
pub const DEFAULT_COMMAND_GAP_THRESHOLD: u64 = 64;

/// Default leader lease for bounded-linearizable reads, in milliseconds.
pub const DEFAULT_LINEARIZABLE_LEASE_MS: u64 = 500;

// =============================================================================
// Pool
// =============================================================================

/// Default buffer pool capacity (number of pooled buffers; 0 = unbounded).
pub const DEFAULT_POOL_CAPACITY: usize = 0;

/// Initial capacity of a pooled buffer (16 KB).
pub const DEFAULT_BUFFER_CAPACITY: usize = 16 * 1024;

/// Buffers that grew beyond this are not recycled (1 MB).
pub const MAX_POOLED_BUFFER_SIZE: usize = 1024 * 1024;

// =============================================================================
// Server
// =============================================================================

/// Maximum connections allowed from a single IP address.
pub const DEFAULT_MAX_CONNECTIONS_PER_IP: usize = 64;

/// Maximum total connections across all clients (0 = unlimited).
pub const DEFAULT_MAX_TOTAL_CONNECTIONS: usize = 4_096;

/// Timeout for reading a complete request frame, in seconds.
pub const DEFAULT_REQUEST_READ_TIMEOUT_SECS: u64 = 300;

/// Timeout for handling a single request, in seconds.
pub const DEFAULT_REQUEST_HANDLER_TIMEOUT_SECS: u64 = 30;

/// Interval between quiescent-resource reaper passes, in milliseconds.
pub const DEFAULT_REAPER_INTERVAL_MS: u64 = 1_000;
