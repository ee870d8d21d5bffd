//! Response messages.
//!
//! Every response echoes the correlation id of the request it answers and
//! carries a [`Status`]; failed responses attach a [`ResponseError`] with
//! one of the wire error codes.

use serde::{Deserialize, Serialize};

use super::MessageKind;
use crate::error::{CoordError, ErrorCode};
use crate::types::{CommitIndex, CorrelationId, EventIndex, SessionId};

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    Error,
}

/// The error sub-object of a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i16,
    pub message: String,
}

impl ResponseError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code as i16,
            message: message.into(),
        }
    }

    /// The typed error code, if the numeric value is recognized.
    pub fn code(&self) -> Option<ErrorCode> {
        num_traits::FromPrimitive::from_i16(self.code)
    }
}

impl From<&CoordError> for ResponseError {
    fn from(err: &CoordError) -> Self {
        ResponseError::new(err.code(), err.to_string())
    }
}

/// A server-to-client (or, for Publish, client-to-server) response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Connect(ConnectResponse),
    Register(RegisterResponse),
    KeepAlive(KeepAliveResponse),
    Unregister(UnregisterResponse),
    Command(CommandResponse),
    Query(QueryResponse),
    Publish(PublishResponse),
}

impl Response {
    /// The correlation id shared by all response kinds.
    pub fn id(&self) -> CorrelationId {
        match self {
            Response::Connect(r) => r.id,
            Response::Register(r) => r.id,
            Response::KeepAlive(r) => r.id,
            Response::Unregister(r) => r.id,
            Response::Command(r) => r.id,
            Response::Query(r) => r.id,
            Response::Publish(r) => r.id,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Response::Connect(_) => MessageKind::Connect,
            Response::Register(_) => MessageKind::Register,
            Response::KeepAlive(_) => MessageKind::KeepAlive,
            Response::Unregister(_) => MessageKind::Unregister,
            Response::Command(_) => MessageKind::Command,
            Response::Query(_) => MessageKind::Query,
            Response::Publish(_) => MessageKind::Publish,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub id: CorrelationId,
    pub status: Status,
    pub error: Option<ResponseError>,
    /// Address of the current leader, if known.
    pub leader: Option<String>,
    /// Addresses of all cluster members.
    pub members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub id: CorrelationId,
    pub status: Status,
    pub error: Option<ResponseError>,
    pub session_id: SessionId,
    /// The timeout granted by the server, which may differ from the one
    /// requested.
    pub timeout_ms: u64,
    pub leader: Option<String>,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveResponse {
    pub id: CorrelationId,
    pub status: Status,
    pub error: Option<ResponseError>,
    pub leader: Option<String>,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterResponse {
    pub id: CorrelationId,
    pub status: Status,
    pub error: Option<ResponseError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub id: CorrelationId,
    pub status: Status,
    pub error: Option<ResponseError>,
    /// Commit index at which the command was applied.
    pub index: CommitIndex,
    /// The session's event index after this command's events, letting the
    /// client order the reply against its event stream.
    pub event_index: EventIndex,
    pub result: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub id: CorrelationId,
    pub status: Status,
    pub error: Option<ResponseError>,
    /// Commit index at which the query was evaluated.
    pub index: CommitIndex,
    /// The session's event index at evaluation time.
    pub event_index: EventIndex,
    pub result: Vec<u8>,
}

/// Client acknowledgement of a Publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResponse {
    pub id: CorrelationId,
    pub status: Status,
    pub error: Option<ResponseError>,
    pub session_id: SessionId,
    /// Highest event index the client has processed; releases all events up
    /// to and including it.
    pub index: EventIndex,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceId;

    #[test]
    fn test_response_error_from_coord_error() {
        let err = CoordError::UnknownResource(ResourceId::new(9));
        let wire = ResponseError::from(&err);
        assert_eq!(wire.code(), Some(ErrorCode::UnknownResource));
        assert!(wire.message.contains('9'));
    }

    #[test]
    fn test_unrecognized_code_maps_to_none() {
        let wire = ResponseError {
            code: 99,
            message: "?".to_string(),
        };
        assert_eq!(wire.code(), None);
    }

    #[test]
    fn test_response_id_accessor() {
        let resp = Response::Unregister(UnregisterResponse {
            id: CorrelationId::new(3),
            status: Status::Ok,
            error: None,
        });
        assert_eq!(resp.id(), CorrelationId::new(3));
        assert_eq!(resp.kind(), MessageKind::Unregister);
    }
}
