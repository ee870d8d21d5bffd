//! Request/response envelope for the coordination protocol.
//!
//! Eight message kinds flow between clients and servers: Connect, Register,
//! KeepAlive, Unregister, Command, Query, Publish, and the Event records
//! carried inside a Publish. Every message carries a per-connection
//! monotonically increasing correlation `id`; responses echo the `id` of the
//! request they answer.
//!
//! The envelope is independent of wire encoding: [`codec`] provides a
//! compact binary form (bincode) and a JSON form that round-trip the same
//! semantic fields.

pub mod codec;
pub mod request;
pub mod response;

pub use request::{
    CommandRequest, ConnectRequest, Event, KeepAliveRequest, PublishRequest, QueryRequest,
    RegisterRequest, Request, UnregisterRequest,
};
pub use response::{
    CommandResponse, ConnectResponse, KeepAliveResponse, PublishResponse, QueryResponse,
    RegisterResponse, Response, ResponseError, Status, UnregisterResponse,
};

use serde::{Deserialize, Serialize};

/// Protocol message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Connect,
    Register,
    KeepAlive,
    Unregister,
    Command,
    Query,
    Publish,
    Event,
}

impl MessageKind {
    /// Static string name for logging without allocation.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Connect => "Connect",
            MessageKind::Register => "Register",
            MessageKind::KeepAlive => "KeepAlive",
            MessageKind::Unregister => "Unregister",
            MessageKind::Command => "Command",
            MessageKind::Query => "Query",
            MessageKind::Publish => "Publish",
            MessageKind::Event => "Event",
        }
    }
}

/// Consistency level for queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Consistency {
    /// Executed at the state observed after all of this session's commands
    /// with lower sequences; may reflect later commands.
    Causal,
    /// Executed at a state at least as recent as the latest command this
    /// session has observed, without a leader round-trip.
    Sequential,
    /// Executed at the leader after a round-trip confirming leadership;
    /// reflects all commits at or below the read index at dispatch.
    #[default]
    Linearizable,
    /// Linearizable using a cached leader lease; may avoid the round-trip
    /// while the lease is valid.
    BoundedLinearizable,
}

impl Consistency {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Consistency::Causal => "CAUSAL",
            Consistency::Sequential => "SEQUENTIAL",
            Consistency::Linearizable => "LINEARIZABLE",
            Consistency::BoundedLinearizable => "BOUNDED_LINEARIZABLE",
        }
    }
}

/// A framed protocol message, request or response.
///
/// Connections are bidirectional: clients send requests and receive
/// responses, but the server also sends Publish requests and receives
/// Publish responses over the same connection, so frames carry a direction
/// tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Request(Request),
    Response(Response),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(MessageKind::Connect.as_str(), "Connect");
        assert_eq!(MessageKind::Publish.as_str(), "Publish");
        assert_eq!(MessageKind::Event.as_str(), "Event");
    }

    #[test]
    fn test_consistency_default_is_linearizable() {
        assert_eq!(Consistency::default(), Consistency::Linearizable);
    }

    #[test]
    fn test_consistency_names() {
        assert_eq!(
            Consistency::BoundedLinearizable.as_str(),
            "BOUNDED_LINEARIZABLE"
        );
        assert_eq!(Consistency::Causal.as_str(), "CAUSAL");
    }
}
