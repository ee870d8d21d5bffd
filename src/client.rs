//! Client-side session state machine.
//!
//! Transport-independent bookkeeping for one client session: correlation
//! and command sequence assignment, keep-alive construction, event-stream
//! gap detection, and the recovery decision after an expiry. The caller
//! owns the socket; this type only builds requests and interprets
//! responses.

use crate::error::{CoordError, CoordResult};
use crate::protocol::request::{
    CommandRequest, ConnectRequest, Event, KeepAliveRequest, PublishRequest, QueryRequest,
    RegisterRequest, UnregisterRequest,
};
use crate::protocol::response::{PublishResponse, RegisterResponse, ResponseError, Status};
use crate::protocol::Consistency;
use crate::types::{ClientId, CorrelationId, EventIndex, ResourceId, Sequence, SessionId, TypeId};

/// Client session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No session established yet.
    Disconnected,
    /// Session live.
    Open,
    /// The event stream gapped or the session expired; a new registration
    /// under the same client id is required.
    Recovering,
    /// Unregistered.
    Closed,
}

/// Result of processing a server Publish.
#[derive(Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Events are contiguous: deliver them and send the acknowledgement.
    Deliver {
        events: Vec<Event>,
        ack: PublishResponse,
    },
    /// The batch does not connect to what the client has seen; the session
    /// must be recovered.
    Gap {
        expected: EventIndex,
        received: EventIndex,
    },
}

/// State for one client session.
#[derive(Debug)]
pub struct ClientSession {
    client_id: ClientId,
    session_id: SessionId,
    timeout_ms: u64,
    state: ClientState,
    next_correlation: CorrelationId,
    /// Last command sequence assigned.
    sequence: Sequence,
    /// Highest command sequence the server has responded to.
    completed_sequence: Sequence,
    /// Highest event index processed.
    event_index: EventIndex,
}

impl ClientSession {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            client_id: ClientId::UNSET,
            session_id: SessionId::NONE,
            timeout_ms,
            state: ClientState::Disconnected,
            next_correlation: CorrelationId::new(1),
            sequence: Sequence::ZERO,
            completed_sequence: Sequence::ZERO,
            event_index: EventIndex::ZERO,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Build the transport handshake.
    pub fn connect_request(&mut self) -> ConnectRequest {
        ConnectRequest {
            id: self.correlate(),
            client_id: self.client_id,
        }
    }

    /// Build a registration request (initial or recovery).
    pub fn register_request(&mut self) -> RegisterRequest {
        RegisterRequest {
            id: self.correlate(),
            client_id: self.client_id,
            timeout_ms: self.timeout_ms,
        }
    }

    /// Absorb a registration response, entering the `Open` state.
    pub fn handle_register_response(&mut self, response: &RegisterResponse) -> CoordResult<()> {
        if response.status != Status::Ok {
            return Err(response_error(&response.error));
        }

        self.session_id = response.session_id;
        // A brand-new client's stable id is its first session's id.
        if !self.client_id.is_assigned() {
            self.client_id = ClientId::new(response.session_id.value());
        }
        if response.timeout_ms != 0 {
            self.timeout_ms = response.timeout_ms;
        }
        self.state = ClientState::Open;
        self.sequence = Sequence::ZERO;
        self.completed_sequence = Sequence::ZERO;
        self.event_index = EventIndex::ZERO;
        Ok(())
    }

    /// Build the next command, assigning its sequence.
    pub fn command_request(
        &mut self,
        resource_id: ResourceId,
        type_id: TypeId,
        bytes: Vec<u8>,
    ) -> CommandRequest {
        self.sequence = self.sequence.next();
        CommandRequest {
            id: self.correlate(),
            session_id: self.session_id,
            sequence: self.sequence,
            resource_id,
            type_id,
            bytes,
        }
    }

    /// Rebuild a command for retransmission with its original sequence.
    pub fn retry_command_request(
        &mut self,
        sequence: Sequence,
        resource_id: ResourceId,
        type_id: TypeId,
        bytes: Vec<u8>,
    ) -> CommandRequest {
        CommandRequest {
            id: self.correlate(),
            session_id: self.session_id,
            sequence,
            resource_id,
            type_id,
            bytes,
        }
    }

    /// Record that the server answered a command.
    pub fn record_command_completion(&mut self, sequence: Sequence) {
        if sequence > self.completed_sequence {
            self.completed_sequence = sequence;
        }
    }

    /// Build a query ordered against this session's commands.
    pub fn query_request(
        &mut self,
        resource_id: ResourceId,
        type_id: TypeId,
        bytes: Vec<u8>,
        consistency: Consistency,
    ) -> QueryRequest {
        QueryRequest {
            id: self.correlate(),
            session_id: self.session_id,
            sequence: self.sequence,
            resource_id,
            type_id,
            bytes,
            consistency,
            deadline_ms: None,
        }
    }

    /// Build a keep-alive acknowledging everything processed so far.
    pub fn keep_alive_request(&mut self) -> KeepAliveRequest {
        KeepAliveRequest {
            id: self.correlate(),
            session_id: self.session_id,
            command_sequence_ack: self.completed_sequence,
            event_index_ack: self.event_index,
        }
    }

    /// Build a graceful close.
    pub fn unregister_request(&mut self) -> UnregisterRequest {
        self.state = ClientState::Closed;
        UnregisterRequest {
            id: self.correlate(),
            session_id: self.session_id,
        }
    }

    /// Process a server Publish: deliver contiguous events or flag a gap.
    pub fn handle_publish(&mut self, publish: PublishRequest) -> PublishOutcome {
        if publish.previous_index != self.event_index {
            self.state = ClientState::Recovering;
            return PublishOutcome::Gap {
                expected: self.event_index,
                received: publish.previous_index,
            };
        }

        self.event_index = publish.event_index;
        PublishOutcome::Deliver {
            ack: PublishResponse {
                id: publish.id,
                status: Status::Ok,
                error: None,
                session_id: publish.session_id,
                index: publish.event_index,
            },
            events: publish.events,
        }
    }

    /// The server reported the session gone; keep the client id and
    /// require a fresh registration.
    pub fn mark_expired(&mut self) {
        self.session_id = SessionId::NONE;
        self.state = ClientState::Recovering;
    }

    fn correlate(&mut self) -> CorrelationId {
        let id = self.next_correlation;
        self.next_correlation = self.next_correlation.next();
        id
    }
}

fn response_error(error: &Option<ResponseError>) -> CoordError {
    match error {
        Some(err) => CoordError::Protocol(format!("registration failed: {}", err.message)),
        None => CoordError::Protocol("registration failed".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered() -> ClientSession {
        let mut session = ClientSession::new(5_000);
        session
            .handle_register_response(&RegisterResponse {
                id: CorrelationId::new(1),
                status: Status::Ok,
                error: None,
                session_id: SessionId::new(4),
                timeout_ms: 5_000,
                leader: None,
                members: vec![],
            })
            .unwrap();
        session
    }

    #[test]
    fn test_new_client_adopts_session_id_as_client_id() {
        let session = registered();
        assert_eq!(session.state(), ClientState::Open);
        assert_eq!(session.session_id(), SessionId::new(4));
        assert_eq!(session.client_id(), ClientId::new(4));
    }

    #[test]
    fn test_commands_get_ascending_sequences() {
        let mut session = registered();
        let first = session.command_request(ResourceId::new(7), TypeId::new(1), vec![]);
        let second = session.command_request(ResourceId::new(7), TypeId::new(1), vec![]);
        assert_eq!(first.sequence, Sequence::new(1));
        assert_eq!(second.sequence, Sequence::new(2));
        assert!(second.id > first.id);
    }

    #[test]
    fn test_retry_reuses_sequence() {
        let mut session = registered();
        let original = session.command_request(ResourceId::new(7), TypeId::new(1), vec![1]);
        let retry = session.retry_command_request(
            original.sequence,
            ResourceId::new(7),
            TypeId::new(1),
            vec![1],
        );
        assert_eq!(retry.sequence, original.sequence);
        assert_ne!(retry.id, original.id);
    }

    #[test]
    fn test_keep_alive_acks_progress() {
        let mut session = registered();
        session.command_request(ResourceId::new(7), TypeId::new(1), vec![]);
        session.record_command_completion(Sequence::new(1));

        let publish = PublishRequest {
            id: CorrelationId::new(9),
            session_id: session.session_id(),
            event_index: EventIndex::new(1),
            previous_index: EventIndex::ZERO,
            events: vec![],
        };
        session.handle_publish(publish);

        let keep_alive = session.keep_alive_request();
        assert_eq!(keep_alive.command_sequence_ack, Sequence::new(1));
        assert_eq!(keep_alive.event_index_ack, EventIndex::new(1));
    }

    #[test]
    fn test_contiguous_publishes_deliver_in_order() {
        let mut session = registered();

        for index in 1..=3u64 {
            let outcome = session.handle_publish(PublishRequest {
                id: CorrelationId::new(index),
                session_id: session.session_id(),
                event_index: EventIndex::new(index),
                previous_index: EventIndex::new(index - 1),
                events: vec![],
            });
            match outcome {
                PublishOutcome::Deliver { ack, .. } => {
                    assert_eq!(ack.index, EventIndex::new(index));
                }
                PublishOutcome::Gap { .. } => panic!("unexpected gap"),
            }
        }
    }

    #[test]
    fn test_gap_triggers_recovery() {
        let mut session = registered();

        let outcome = session.handle_publish(PublishRequest {
            id: CorrelationId::new(1),
            session_id: session.session_id(),
            event_index: EventIndex::new(5),
            previous_index: EventIndex::new(4),
            events: vec![],
        });

        assert_eq!(
            outcome,
            PublishOutcome::Gap {
                expected: EventIndex::ZERO,
                received: EventIndex::new(4),
            }
        );
        assert_eq!(session.state(), ClientState::Recovering);
    }

    #[test]
    fn test_recovery_keeps_client_id() {
        let mut session = registered();
        session.mark_expired();
        assert_eq!(session.state(), ClientState::Recovering);
        assert_eq!(session.client_id(), ClientId::new(4));

        let register = session.register_request();
        assert_eq!(register.client_id, ClientId::new(4));

        session
            .handle_register_response(&RegisterResponse {
                id: register.id,
                status: Status::Ok,
                error: None,
                session_id: SessionId::new(9),
                timeout_ms: 5_000,
                leader: None,
                members: vec![],
            })
            .unwrap();
        assert_eq!(session.session_id(), SessionId::new(9));
        assert_eq!(session.client_id(), ClientId::new(4));
    }
}
