//! Type-safe wrappers for protocol primitives.
//!
//! These newtypes prevent mixing up identifiers that share an underlying
//! integer representation but have different semantic meanings: a session id
//! is not a resource id is not a command sequence number.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A server-assigned session identifier.
///
/// Session ids are unique and monotonically increasing: a session's id is the
/// commit index of the log entry that registered it. Id `0` is never assigned.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Sentinel for "no session" (e.g. before registration completes).
    pub const NONE: Self = SessionId(0);

    #[inline]
    pub const fn new(value: u64) -> Self {
        SessionId(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }
}

/// A client identifier, stable across session recovery.
///
/// A client registering for the first time sends `ClientId::UNSET`; the server
/// allocates a fresh id and the client reuses it when recovering an expired
/// session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ClientId(pub u64);

impl ClientId {
    /// A client that has not been assigned an id yet.
    pub const UNSET: Self = ClientId(0);

    #[inline]
    pub const fn new(value: u64) -> Self {
        ClientId(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Whether this client already holds a server-assigned id.
    #[inline]
    pub const fn is_assigned(self) -> bool {
        self.0 != 0
    }
}

/// A cluster-unique identifier for a replicated state machine instance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ResourceId(pub u64);

impl ResourceId {
    #[inline]
    pub const fn new(value: u64) -> Self {
        ResourceId(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }
}

/// Identifies which state-machine implementation backs a resource.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TypeId(pub u64);

impl TypeId {
    #[inline]
    pub const fn new(value: u64) -> Self {
        TypeId(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }
}

/// A per-session monotonic counter on commands.
///
/// Sequences start at 1; the server applies commands in strictly ascending
/// sequence order with no gaps, which is what makes retries exactly-once.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Sequence(pub u64);

impl Sequence {
    /// The sequence value before any command has been applied.
    pub const ZERO: Self = Sequence(0);

    #[inline]
    pub const fn new(value: u64) -> Self {
        Sequence(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The next expected sequence after this one.
    #[inline]
    pub const fn next(self) -> Self {
        Sequence(self.0 + 1)
    }
}

/// A per-session monotonic index on server-to-client events.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EventIndex(pub u64);

impl EventIndex {
    /// The index before any event has been published.
    pub const ZERO: Self = EventIndex(0);

    #[inline]
    pub const fn new(value: u64) -> Self {
        EventIndex(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn next(self) -> Self {
        EventIndex(self.0 + 1)
    }
}

/// A position in the replicated log, assigned by the consensus layer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CommitIndex(pub u64);

impl CommitIndex {
    /// The index before the first committed entry.
    pub const ZERO: Self = CommitIndex(0);

    #[inline]
    pub const fn new(value: u64) -> Self {
        CommitIndex(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }
}

/// A per-connection monotonically increasing request correlation id.
///
/// Responses echo the id of the request they answer, letting a client match
/// out-of-order completions to in-flight requests.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CorrelationId(pub u64);

impl CorrelationId {
    #[inline]
    pub const fn new(value: u64) -> Self {
        CorrelationId(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn next(self) -> Self {
        CorrelationId(self.0 + 1)
    }
}

macro_rules! impl_id_conversions {
    ($($ty:ident),* $(,)?) => {
        $(
            impl From<u64> for $ty {
                fn from(value: u64) -> Self {
                    $ty(value)
                }
            }

            impl From<$ty> for u64 {
                fn from(id: $ty) -> Self {
                    id.0
                }
            }

            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )*
    };
}

impl_id_conversions!(
    SessionId,
    ClientId,
    ResourceId,
    TypeId,
    Sequence,
    EventIndex,
    CommitIndex,
    CorrelationId,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_next() {
        assert_eq!(Sequence::ZERO.next(), Sequence::new(1));
        assert_eq!(Sequence::new(41).next().value(), 42);
    }

    #[test]
    fn test_client_id_assignment() {
        assert!(!ClientId::UNSET.is_assigned());
        assert!(ClientId::new(7).is_assigned());
    }

    #[test]
    fn test_display_and_conversions() {
        let id = SessionId::from(12u64);
        assert_eq!(id.to_string(), "12");
        assert_eq!(u64::from(id), 12);
    }

    #[test]
    fn test_serde_transparent() {
        let idx = EventIndex::new(9);
        let json = serde_json::to_string(&idx).unwrap();
        assert_eq!(json, "9");
        let back: EventIndex = serde_json::from_str(&json).unwrap();
        assert_eq!(back, idx);
    }

    #[test]
    fn test_ordering() {
        assert!(CommitIndex::new(1) < CommitIndex::new(2));
        assert!(EventIndex::ZERO < EventIndex::new(1));
    }
}
