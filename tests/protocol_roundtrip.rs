//! Envelope round-trip tests across both wire encodings.

use concord::error::ErrorCode;
use concord::protocol::codec::{
    decode_binary, decode_json, encode_binary, encode_frame, encode_json, split_frame,
};
use concord::protocol::request::*;
use concord::protocol::response::*;
use concord::protocol::{Consistency, Message};
use concord::types::*;

use bytes::BytesMut;

fn all_requests() -> Vec<Request> {
    vec![
        Request::Connect(ConnectRequest {
            id: CorrelationId::new(1),
            client_id: ClientId::UNSET,
        }),
        Request::Register(RegisterRequest {
            id: CorrelationId::new(2),
            client_id: ClientId::new(8),
            timeout_ms: 5_000,
        }),
        Request::KeepAlive(KeepAliveRequest {
            id: CorrelationId::new(3),
            session_id: SessionId::new(4),
            command_sequence_ack: Sequence::new(10),
            event_index_ack: EventIndex::new(6),
        }),
        Request::Unregister(UnregisterRequest {
            id: CorrelationId::new(4),
            session_id: SessionId::new(4),
        }),
        Request::Command(CommandRequest {
            id: CorrelationId::new(5),
            session_id: SessionId::new(4),
            sequence: Sequence::new(11),
            resource_id: ResourceId::new(7),
            type_id: TypeId::new(2),
            bytes: vec![0, 1, 2, 255],
        }),
        Request::Query(QueryRequest {
            id: CorrelationId::new(6),
            session_id: SessionId::new(4),
            sequence: Sequence::new(11),
            resource_id: ResourceId::new(7),
            type_id: TypeId::new(2),
            bytes: vec![9],
            consistency: Consistency::Causal,
            deadline_ms: Some(1_000),
        }),
        Request::Publish(PublishRequest {
            id: CorrelationId::new(7),
            session_id: SessionId::new(4),
            event_index: EventIndex::new(9),
            previous_index: EventIndex::new(7),
            events: vec![
                Event {
                    resource_id: ResourceId::new(7),
                    event_index: EventIndex::new(8),
                    payload: vec![1],
                },
                Event {
                    resource_id: ResourceId::new(7),
                    event_index: EventIndex::new(9),
                    payload: vec![2],
                },
            ],
        }),
    ]
}

fn all_responses() -> Vec<Response> {
    vec![
        Response::Connect(ConnectResponse {
            id: CorrelationId::new(1),
            status: Status::Ok,
            error: None,
            leader: Some("127.0.0.1:8700".to_string()),
            members: vec!["127.0.0.1:8700".to_string(), "127.0.0.1:8701".to_string()],
        }),
        Response::Register(RegisterResponse {
            id: CorrelationId::new(2),
            status: Status::Ok,
            error: None,
            session_id: SessionId::new(4),
            timeout_ms: 5_000,
            leader: None,
            members: vec![],
        }),
        Response::KeepAlive(KeepAliveResponse {
            id: CorrelationId::new(3),
            status: Status::Error,
            error: Some(ResponseError::new(ErrorCode::UnknownSession, "gone")),
            leader: None,
            members: vec![],
        }),
        Response::Unregister(UnregisterResponse {
            id: CorrelationId::new(4),
            status: Status::Ok,
            error: None,
        }),
        Response::Command(CommandResponse {
            id: CorrelationId::new(5),
            status: Status::Ok,
            error: None,
            index: CommitIndex::new(12),
            event_index: EventIndex::new(9),
            result: vec![42],
        }),
        Response::Query(QueryResponse {
            id: CorrelationId::new(6),
            status: Status::Error,
            error: Some(ResponseError::new(ErrorCode::QueryFailure, "deadline")),
            index: CommitIndex::ZERO,
            event_index: EventIndex::ZERO,
            result: vec![],
        }),
        Response::Publish(PublishResponse {
            id: CorrelationId::new(7),
            status: Status::Ok,
            error: None,
            session_id: SessionId::new(4),
            index: EventIndex::new(9),
        }),
    ]
}

#[test]
fn binary_roundtrip_is_identity_for_every_kind() {
    for request in all_requests() {
        let message = Message::Request(request);
        let decoded = decode_binary(&encode_binary(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);
    }
    for response in all_responses() {
        let message = Message::Response(response);
        let decoded = decode_binary(&encode_binary(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);
    }
}

#[test]
fn json_roundtrip_is_identity_for_every_kind() {
    for request in all_requests() {
        let message = Message::Request(request);
        let decoded = decode_json(&encode_json(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);
    }
    for response in all_responses() {
        let message = Message::Response(response);
        let decoded = decode_json(&encode_json(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);
    }
}

#[test]
fn responses_echo_request_correlation_ids() {
    let requests = all_requests();
    let responses = all_responses();
    for (request, response) in requests.iter().zip(responses.iter()) {
        assert_eq!(request.id(), response.id());
        assert_eq!(request.kind(), response.kind());
    }
}

#[test]
fn framed_stream_reassembles_across_partial_reads() {
    let messages: Vec<Message> = all_requests().into_iter().map(Message::Request).collect();

    // One contiguous byte stream of all frames.
    let mut wire = Vec::new();
    for message in &messages {
        wire.extend_from_slice(&encode_frame(message).unwrap());
    }

    // Feed it in 3-byte slices as a slow socket would.
    let mut buf = BytesMut::new();
    let mut decoded = Vec::new();
    for chunk in wire.chunks(3) {
        buf.extend_from_slice(chunk);
        while let Some(frame) = split_frame(&mut buf).unwrap() {
            decoded.push(decode_binary(&frame).unwrap());
        }
    }

    assert_eq!(decoded, messages);
}

#[test]
fn wire_error_codes_survive_json() {
    let response = Response::Command(CommandResponse {
        id: CorrelationId::new(1),
        status: Status::Error,
        error: Some(ResponseError::new(ErrorCode::NoLeader, "not the leader")),
        index: CommitIndex::ZERO,
        event_index: EventIndex::ZERO,
        result: vec![],
    });

    let json = encode_json(&Message::Response(response)).unwrap();
    let Message::Response(Response::Command(decoded)) = decode_json(&json).unwrap() else {
        panic!("wrong kind after decode");
    };
    assert_eq!(decoded.error.unwrap().code(), Some(ErrorCode::NoLeader));
}
