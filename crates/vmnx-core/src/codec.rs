//! Wire codec (§4.A) — serializes a `Message` to a self-describing byte
//! buffer and back, plus the TCP length-prefix framing.
//!
//! The codec only validates *structural* correctness (missing fields, wrong
//! discriminator): anything that fails to parse is dropped by the caller.
//! Domain validity (`Message::is_valid`) is a separate concern layered on
//! top, checked after a successful decode.

use thiserror::Error;

use crate::message::Message;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to decode message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("frame length {0} exceeds maximum {1}")]
    FrameTooLarge(u32, u32),
    #[error("frame truncated: declared {declared} bytes, got {got}")]
    FrameTruncated { declared: u32, got: usize },
}

/// Largest single TCP frame the codec will accept. Generous relative to
/// control-plane payloads; guards against a corrupt/adversarial length
/// prefix causing an unbounded allocation.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Serialize a message to its self-describing byte form (no length prefix).
/// Used directly by the UDP path, which frames by datagram boundaries
/// instead.
pub fn encode(msg: &Message) -> Vec<u8> {
    serde_json::to_vec(msg).expect("message serialization is infallible for valid payloads")
}

/// Deserialize a message from its self-describing byte form.
pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Build a TCP frame: 4-byte little-endian length, then the encoded message.
pub fn encode_frame(msg: &Message) -> Vec<u8> {
    let body = encode(msg);
    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
    framed.extend_from_slice(&body);
    framed
}

/// Parse the 4-byte length prefix. Returns an error if it exceeds
/// `MAX_FRAME_LEN`.
pub fn decode_frame_len(prefix: [u8; 4]) -> Result<u32, CodecError> {
    let len = u32::from_le_bytes(prefix);
    if len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(len, MAX_FRAME_LEN));
    }
    Ok(len)
}

/// Decode a complete frame body (the bytes following the length prefix) into
/// a message.
pub fn decode_frame_body(declared_len: u32, body: &[u8]) -> Result<Message, CodecError> {
    if body.len() != declared_len as usize {
        return Err(CodecError::FrameTruncated {
            declared: declared_len,
            got: body.len(),
        });
    }
    decode(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageId, RequestPayload, ResponsePayload};

    #[test]
    fn round_trip_request() {
        let msg = Message::new_request(RequestPayload::Ping { nonce: 42 });
        let bytes = encode(&msg);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.id(), msg.id());
        assert!(decoded.is_valid());
    }

    #[test]
    fn round_trip_response() {
        let req_id = MessageId::generate();
        let msg = Message::new_response(req_id, ResponsePayload::VmCreated { vm_id: 9 });
        let bytes = encode(&msg);
        let decoded = decode(&bytes).unwrap();
        match decoded {
            Message::Response { request_id, .. } => assert_eq!(request_id, req_id),
            _ => panic!("expected Response"),
        }
    }

    #[test]
    fn frame_round_trip() {
        let msg = Message::new_request(RequestPayload::Ping { nonce: 7 });
        let framed = encode_frame(&msg);
        let len = decode_frame_len(framed[..4].try_into().unwrap()).unwrap();
        assert_eq!(len as usize, framed.len() - 4);
        let decoded = decode_frame_body(len, &framed[4..]).unwrap();
        assert_eq!(decoded.id(), msg.id());
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let result = decode(b"not json at all");
        assert!(result.is_err());
    }

    #[test]
    fn oversized_frame_length_is_rejected() {
        let result = decode_frame_len((MAX_FRAME_LEN + 1).to_le_bytes());
        assert!(result.is_err());
    }

    #[test]
    fn truncated_frame_body_is_rejected() {
        let msg = Message::new_request(RequestPayload::Ping { nonce: 1 });
        let body = encode(&msg);
        let result = decode_frame_body(body.len() as u32, &body[..body.len() - 1]);
        assert!(result.is_err());
    }
}
