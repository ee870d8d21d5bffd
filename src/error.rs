//! Crate & protocol level errors.
//!
//! # Error Hierarchy
//!
//! The crate uses a two-layer error hierarchy:
//!
//! ## Transport Layer ([`Error`])
//!
//! Connection and envelope codec errors: network I/O, frame parsing,
//! malformed messages. A transport error terminates the connection.
//!
//! ## Coordination Layer ([`CoordError`])
//!
//! Session, leadership, and state-machine errors produced while applying or
//! routing an operation. These are surfaced to the client inside a response
//! envelope via [`ErrorCode`] rather than tearing down the connection.
//!
//! [`CoordError::code`] maps a coordination error to its wire code.

use std::{io, result};

use num_derive::FromPrimitive;
use thiserror::Error as ThisError;

use crate::types::{ResourceId, SessionId, TypeId};

pub type Result<T> = result::Result<T, Error>;

/// Result alias for coordination-layer operations.
pub type CoordResult<T> = result::Result<T, CoordError>;

/// Transport and envelope codec errors.
///
/// These are low-level errors that occur during network I/O, frame parsing,
/// and connection management. For session and state-machine errors, see
/// [`CoordError`].
#[derive(Debug, ThisError)]
pub enum Error {
    /// An error in the network.
    #[error("IO error: {0:?}")]
    IoError(io::ErrorKind),

    /// Could not decode an envelope from the wire.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Missing data or connection closed.
    #[error("Missing data: {0}")]
    MissingData(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A bounded buffer pool had no capacity left.
    #[error("Buffer pool exhausted (capacity {capacity})")]
    ResourceExhausted { capacity: usize },
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::IoError(e.kind())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

/// Wire error codes carried in the `error` sub-object of a response.
///
/// `0` is reserved for "no error"; responses with `status = OK` omit the
/// error object entirely.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
#[repr(i16)]
pub enum ErrorCode {
    /// The receiving replica is not the leader; the response carries a
    /// leader hint and the client should retry there.
    NoLeader = 1,
    /// The session does not exist or has expired.
    UnknownSession = 2,
    /// The resource id does not map to a live state machine instance.
    UnknownResource = 3,
    /// The command could not be applied (includes sequence-gap expiry).
    CommandFailure = 4,
    /// The query could not be executed at the requested consistency.
    QueryFailure = 5,
    /// The state machine returned an error payload; surfaced verbatim.
    ApplicationError = 6,
    /// Malformed envelope or an operation invalid in the current state.
    ProtocolError = 7,
    /// The operation is invalid for the member's current cluster role.
    IllegalMemberState = 8,
}

impl ErrorCode {
    /// Static string name for logging without allocation.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NoLeader => "NO_LEADER",
            ErrorCode::UnknownSession => "UNKNOWN_SESSION",
            ErrorCode::UnknownResource => "UNKNOWN_RESOURCE",
            ErrorCode::CommandFailure => "COMMAND_FAILURE",
            ErrorCode::QueryFailure => "QUERY_FAILURE",
            ErrorCode::ApplicationError => "APPLICATION_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::IllegalMemberState => "ILLEGAL_MEMBER_STATE",
        }
    }
}

/// Coordination-layer errors surfaced to clients in response envelopes.
#[derive(Debug, Clone, ThisError, PartialEq, Eq)]
pub enum CoordError {
    /// This replica cannot service a mutation; retry at the leader.
    #[error("Not the leader{}", leader_hint_suffix(.leader))]
    NoLeader {
        /// Address of the current leader, if known.
        leader: Option<String>,
    },

    /// The session does not exist or has expired.
    #[error("Unknown session {0}")]
    UnknownSession(SessionId),

    /// The resource does not exist.
    #[error("Unknown resource {0}")]
    UnknownResource(ResourceId),

    /// No factory is registered for the resource type.
    #[error("Unknown resource type {0}")]
    UnknownType(TypeId),

    /// A session missed a command sequence past the gap threshold.
    #[error("Session {session_id} expired with a sequence gap at {missing}")]
    SequenceGap {
        session_id: SessionId,
        missing: u64,
    },

    /// The command could not be applied.
    #[error("Command failure: {0}")]
    CommandFailure(String),

    /// The query could not be executed.
    #[error("Query failure: {0}")]
    QueryFailure(String),

    /// The state machine rejected the operation; the message is the
    /// application's own error text, surfaced verbatim.
    #[error("Application error: {0}")]
    Application(String),

    /// A query missed its deadline; session state is unaffected.
    #[error("Operation timed out")]
    Timeout,

    /// Malformed or state-invalid request.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The operation is invalid for this member's cluster role.
    #[error("Illegal member state: {0}")]
    IllegalMemberState(String),

    /// Internal invariant failure; not client-recoverable.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn leader_hint_suffix(leader: &Option<String>) -> String {
    match leader {
        Some(addr) => format!(" (leader: {addr})"),
        None => String::new(),
    }
}

impl CoordError {
    /// The wire code this error maps to.
    pub fn code(&self) -> ErrorCode {
        match self {
            CoordError::NoLeader { .. } => ErrorCode::NoLeader,
            CoordError::UnknownSession(_) => ErrorCode::UnknownSession,
            CoordError::UnknownResource(_) | CoordError::UnknownType(_) => {
                ErrorCode::UnknownResource
            }
            CoordError::SequenceGap { .. } | CoordError::CommandFailure(_) => {
                ErrorCode::CommandFailure
            }
            CoordError::QueryFailure(_) | CoordError::Timeout => ErrorCode::QueryFailure,
            CoordError::Application(_) => ErrorCode::ApplicationError,
            CoordError::Protocol(_) | CoordError::Internal(_) => ErrorCode::ProtocolError,
            CoordError::IllegalMemberState(_) => ErrorCode::IllegalMemberState,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn test_error_code_from_primitive() {
        assert_eq!(ErrorCode::from_i16(1), Some(ErrorCode::NoLeader));
        assert_eq!(ErrorCode::from_i16(2), Some(ErrorCode::UnknownSession));
        assert_eq!(ErrorCode::from_i16(6), Some(ErrorCode::ApplicationError));
        assert_eq!(ErrorCode::from_i16(8), Some(ErrorCode::IllegalMemberState));
        assert_eq!(ErrorCode::from_i16(0), None);
        assert_eq!(ErrorCode::from_i16(99), None);
    }

    #[test]
    fn test_coord_error_codes() {
        assert_eq!(
            CoordError::UnknownSession(SessionId::new(3)).code(),
            ErrorCode::UnknownSession
        );
        assert_eq!(
            CoordError::NoLeader { leader: None }.code(),
            ErrorCode::NoLeader
        );
        assert_eq!(
            CoordError::SequenceGap {
                session_id: SessionId::new(1),
                missing: 2
            }
            .code(),
            ErrorCode::CommandFailure
        );
        assert_eq!(CoordError::Timeout.code(), ErrorCode::QueryFailure);
    }

    #[test]
    fn test_no_leader_display_includes_hint() {
        let err = CoordError::NoLeader {
            leader: Some("10.0.0.2:5000".to_string()),
        };
        assert!(err.to_string().contains("10.0.0.2:5000"));

        let bare = CoordError::NoLeader { leader: None };
        assert!(!bare.to_string().contains("leader:"));
    }

    #[test]
    fn test_transport_error_from_io() {
        let err: Error = io::Error::new(io::ErrorKind::ConnectionRefused, "refused").into();
        assert!(matches!(
            err,
            Error::IoError(io::ErrorKind::ConnectionRefused)
        ));
    }
}
