//! Request messages.
//!
//! One struct per request kind with the shared correlation id inlined;
//! protocol dispatch is a match on the [`Request`] variant tag.

use serde::{Deserialize, Serialize};

use super::{Consistency, MessageKind};
use crate::types::{
    ClientId, CorrelationId, EventIndex, ResourceId, Sequence, SessionId, TypeId,
};

/// A client-to-server (or, for Publish, server-to-client) request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Connect(ConnectRequest),
    Register(RegisterRequest),
    KeepAlive(KeepAliveRequest),
    Unregister(UnregisterRequest),
    Command(CommandRequest),
    Query(QueryRequest),
    Publish(PublishRequest),
}

impl Request {
    /// The correlation id shared by all request kinds.
    pub fn id(&self) -> CorrelationId {
        match self {
            Request::Connect(r) => r.id,
            Request::Register(r) => r.id,
            Request::KeepAlive(r) => r.id,
            Request::Unregister(r) => r.id,
            Request::Command(r) => r.id,
            Request::Query(r) => r.id,
            Request::Publish(r) => r.id,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Request::Connect(_) => MessageKind::Connect,
            Request::Register(_) => MessageKind::Register,
            Request::KeepAlive(_) => MessageKind::KeepAlive,
            Request::Unregister(_) => MessageKind::Unregister,
            Request::Command(_) => MessageKind::Command,
            Request::Query(_) => MessageKind::Query,
            Request::Publish(_) => MessageKind::Publish,
        }
    }
}

/// Transport handshake. `client_id` is `UNSET` for a brand-new client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub id: CorrelationId,
    pub client_id: ClientId,
}

/// Create a session bound to `client_id` with the given timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub id: CorrelationId,
    pub client_id: ClientId,
    pub timeout_ms: u64,
}

/// Renew session liveness and acknowledge progress.
///
/// `command_sequence_ack` releases the duplicate-suppression cache up to and
/// including that sequence; `event_index_ack` releases pending events up to
/// and including that index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub id: CorrelationId,
    pub session_id: SessionId,
    pub command_sequence_ack: Sequence,
    pub event_index_ack: EventIndex,
}

/// Graceful session close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterRequest {
    pub id: CorrelationId,
    pub session_id: SessionId,
}

/// A user command addressed to a resource.
///
/// `type_id` identifies the state-machine implementation so a fresh
/// `resource_id` can be instantiated on first touch. The payload is opaque
/// to the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub id: CorrelationId,
    pub session_id: SessionId,
    pub sequence: Sequence,
    pub resource_id: ResourceId,
    pub type_id: TypeId,
    pub bytes: Vec<u8>,
}

/// A user query addressed to a resource at a chosen consistency level.
///
/// `sequence` is the session's latest command sequence at submission time;
/// it orders the query against the session's own commands but does not
/// advance the command sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub id: CorrelationId,
    pub session_id: SessionId,
    pub sequence: Sequence,
    pub resource_id: ResourceId,
    pub type_id: TypeId,
    pub bytes: Vec<u8>,
    pub consistency: Consistency,
    /// Optional per-request deadline in milliseconds.
    pub deadline_ms: Option<u64>,
}

/// Server-to-client event delivery.
///
/// Events in the batch carry the contiguous indices
/// `previous_index + 1 ..= event_index`. A client whose last observed index
/// does not match `previous_index` has missed events and must recover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub id: CorrelationId,
    pub session_id: SessionId,
    /// Index of the last event in this batch.
    pub event_index: EventIndex,
    /// Index immediately before the first event in this batch.
    pub previous_index: EventIndex,
    pub events: Vec<Event>,
}

/// A single event published to a session, tagged with the resource that
/// produced it so the client can route it to the right handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub resource_id: ResourceId,
    pub event_index: EventIndex,
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_accessor() {
        let req = Request::Command(CommandRequest {
            id: CorrelationId::new(7),
            session_id: SessionId::new(1),
            sequence: Sequence::new(1),
            resource_id: ResourceId::new(2),
            type_id: TypeId::new(1),
            bytes: vec![1, 2, 3],
        });
        assert_eq!(req.id(), CorrelationId::new(7));
        assert_eq!(req.kind(), MessageKind::Command);
    }

    #[test]
    fn test_publish_batch_indices() {
        let req = PublishRequest {
            id: CorrelationId::new(1),
            session_id: SessionId::new(1),
            event_index: EventIndex::new(10),
            previous_index: EventIndex::new(7),
            events: vec![
                Event {
                    resource_id: ResourceId::new(4),
                    event_index: EventIndex::new(8),
                    payload: vec![],
                },
                Event {
                    resource_id: ResourceId::new(4),
                    event_index: EventIndex::new(9),
                    payload: vec![],
                },
                Event {
                    resource_id: ResourceId::new(4),
                    event_index: EventIndex::new(10),
                    payload: vec![],
                },
            ],
        };
        assert_eq!(
            req.events.len() as u64,
            req.event_index.value() - req.previous_index.value()
        );
    }
}
