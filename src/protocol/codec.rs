//! Envelope encodings and wire framing.
//!
//! Two encodings round-trip the same semantic fields: a compact binary form
//! (bincode) used by the TCP front-end and a JSON form for text transports.
//! Binary messages travel in frames with a 4-byte big-endian length prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::Message;
use crate::constants::{FRAME_PREFIX_SIZE, MAX_FRAME_SIZE};
use crate::error::{Error, Result};

/// Encode a message in the compact binary form.
pub fn encode_binary(message: &Message) -> Result<Vec<u8>> {
    Ok(bincode::serialize(message)?)
}

/// Decode a message from the compact binary form.
pub fn decode_binary(data: &[u8]) -> Result<Message> {
    Ok(bincode::deserialize(data)?)
}

/// Encode a message as JSON.
pub fn encode_json(message: &Message) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Decode a message from JSON.
pub fn decode_json(data: &str) -> Result<Message> {
    Ok(serde_json::from_str(data)?)
}

/// Encode a message into a length-prefixed binary frame.
pub fn encode_frame(message: &Message) -> Result<Vec<u8>> {
    let body = encode_binary(message)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(Error::Codec(format!(
            "frame of {} bytes exceeds maximum {}",
            body.len(),
            MAX_FRAME_SIZE
        )));
    }
    let mut frame = Vec::with_capacity(FRAME_PREFIX_SIZE + body.len());
    frame.put_u32(body.len() as u32);
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Try to split one complete frame body off the front of `buf`.
///
/// Returns `None` until a full frame has accumulated. The length prefix is
/// validated before any allocation happens.
pub fn split_frame(buf: &mut BytesMut) -> Result<Option<Bytes>> {
    if buf.len() < FRAME_PREFIX_SIZE {
        return Ok(None);
    }

    let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(Error::Codec(format!(
            "frame length {size} exceeds maximum {MAX_FRAME_SIZE}"
        )));
    }

    if buf.len() < FRAME_PREFIX_SIZE + size {
        return Ok(None);
    }

    buf.advance(FRAME_PREFIX_SIZE);
    Ok(Some(buf.split_to(size).freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::request::{
        CommandRequest, ConnectRequest, Event, KeepAliveRequest, PublishRequest, QueryRequest,
        RegisterRequest, Request, UnregisterRequest,
    };
    use crate::protocol::response::{
        CommandResponse, PublishResponse, Response, ResponseError, Status,
    };
    use crate::protocol::Consistency;
    use crate::error::ErrorCode;
    use crate::types::{
        ClientId, CorrelationId, CommitIndex, EventIndex, ResourceId, Sequence, SessionId, TypeId,
    };

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::Request(Request::Connect(ConnectRequest {
                id: CorrelationId::new(1),
                client_id: ClientId::UNSET,
            })),
            Message::Request(Request::Register(RegisterRequest {
                id: CorrelationId::new(2),
                client_id: ClientId::new(5),
                timeout_ms: 5000,
            })),
            Message::Request(Request::KeepAlive(KeepAliveRequest {
                id: CorrelationId::new(3),
                session_id: SessionId::new(1),
                command_sequence_ack: Sequence::new(4),
                event_index_ack: EventIndex::new(2),
            })),
            Message::Request(Request::Unregister(UnregisterRequest {
                id: CorrelationId::new(4),
                session_id: SessionId::new(1),
            })),
            Message::Request(Request::Command(CommandRequest {
                id: CorrelationId::new(5),
                session_id: SessionId::new(1),
                sequence: Sequence::new(5),
                resource_id: ResourceId::new(7),
                type_id: TypeId::new(1),
                bytes: vec![0xde, 0xad],
            })),
            Message::Request(Request::Query(QueryRequest {
                id: CorrelationId::new(6),
                session_id: SessionId::new(1),
                sequence: Sequence::new(5),
                resource_id: ResourceId::new(7),
                type_id: TypeId::new(1),
                bytes: vec![],
                consistency: Consistency::BoundedLinearizable,
                deadline_ms: Some(200),
            })),
            Message::Request(Request::Publish(PublishRequest {
                id: CorrelationId::new(7),
                session_id: SessionId::new(1),
                event_index: EventIndex::new(3),
                previous_index: EventIndex::new(2),
                events: vec![Event {
                    resource_id: ResourceId::new(7),
                    event_index: EventIndex::new(3),
                    payload: vec![1],
                }],
            })),
            Message::Response(Response::Command(CommandResponse {
                id: CorrelationId::new(5),
                status: Status::Error,
                error: Some(ResponseError::new(ErrorCode::CommandFailure, "nope")),
                index: CommitIndex::new(12),
                event_index: EventIndex::new(3),
                result: vec![],
            })),
            Message::Response(Response::Publish(PublishResponse {
                id: CorrelationId::new(7),
                status: Status::Ok,
                error: None,
                session_id: SessionId::new(1),
                index: EventIndex::new(3),
            })),
        ]
    }

    #[test]
    fn test_binary_roundtrip_is_identity() {
        for message in sample_messages() {
            let encoded = encode_binary(&message).unwrap();
            let decoded = decode_binary(&encoded).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_json_roundtrip_is_identity() {
        for message in sample_messages() {
            let encoded = encode_json(&message).unwrap();
            let decoded = decode_json(&encoded).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_frame_roundtrip() {
        for message in sample_messages() {
            let frame = encode_frame(&message).unwrap();
            let mut buf = BytesMut::from(&frame[..]);
            let body = split_frame(&mut buf).unwrap().expect("complete frame");
            assert!(buf.is_empty());
            assert_eq!(decode_binary(&body).unwrap(), message);
        }
    }

    #[test]
    fn test_split_frame_waits_for_complete_frame() {
        let message = &sample_messages()[0];
        let frame = encode_frame(message).unwrap();

        let mut buf = BytesMut::from(&frame[..frame.len() - 1]);
        assert!(split_frame(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[frame.len() - 1..]);
        assert!(split_frame(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_split_frame_rejects_oversized_prefix() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        assert!(split_frame(&mut buf).is_err());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let messages = sample_messages();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(&messages[0]).unwrap());
        buf.extend_from_slice(&encode_frame(&messages[1]).unwrap());

        let first = split_frame(&mut buf).unwrap().unwrap();
        let second = split_frame(&mut buf).unwrap().unwrap();
        assert_eq!(decode_binary(&first).unwrap(), messages[0]);
        assert_eq!(decode_binary(&second).unwrap(), messages[1]);
        assert!(split_frame(&mut buf).unwrap().is_none());
    }
}
