//! Codecs for encoding and decoding Beacon messages.
//!
//! Binary frames use MessagePack with a 4-byte length prefix. Text frames
//! carry a single JSON document with no prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a message to a length-prefixed MessagePack frame.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded message
///
/// # Errors
///
/// Returns an error if the message is too large or encoding fails.
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(message, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a message into an existing buffer.
///
/// # Errors
///
/// Returns an error if the message is too large or encoding fails.
pub fn encode_into<T: Serialize>(message: &T, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(message)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a message from a complete length-prefixed frame.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?)
}

/// Try to decode a message from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(message))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);

    Ok(Some(rmp_serde::from_slice(&payload)?))
}

/// Encode a message as a JSON text frame.
///
/// # Errors
///
/// Returns an error if serialization fails or the text exceeds the frame limit.
pub fn encode_json<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(message)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode a message from a JSON text frame.
///
/// # Errors
///
/// Returns an error if the text is too large or not a valid message.
pub fn decode_json<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ClientMessage, ServerMessage};
    use serde_json::json;

    #[test]
    fn test_binary_roundtrip() {
        let messages = vec![
            ClientMessage::join_room("dashboard:acme:ops"),
            ClientMessage::publish_metric("cpu", 0.75),
            ClientMessage::CollaborateDashboard {
                dashboard_id: "ops".to_string(),
                action: "cursor".to_string(),
                collaborative_data: json!({"x": 10, "y": 20}),
            },
        ];

        for message in messages {
            let encoded = encode(&message).unwrap();
            let decoded: ClientMessage = decode(&encoded).unwrap();
            assert_eq!(message, decoded);
        }
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode(&ClientMessage::join_room("org:acme")).unwrap();

        let partial = &encoded[..5];
        match decode::<ClientMessage>(partial) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_too_large() {
        let oversized = "x".repeat(MAX_FRAME_SIZE + 1);
        let message = ServerMessage::error("INTERNAL", oversized);

        match encode(&message) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_decode() {
        let first = ClientMessage::join_room("org:acme");
        let second = ClientMessage::leave_room("org:acme");

        let mut buf = BytesMut::new();
        encode_into(&first, &mut buf).unwrap();
        encode_into(&second, &mut buf).unwrap();

        let decoded1: ClientMessage = decode_from(&mut buf).unwrap().unwrap();
        let decoded2: ClientMessage = decode_from(&mut buf).unwrap().unwrap();

        assert_eq!(first, decoded1);
        assert_eq!(second, decoded2);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_json_text_frame() {
        let text = r#"{"type":"leave_room","data":{"room":"org:acme"}}"#;
        let decoded: ClientMessage = decode_json(text).unwrap();
        assert_eq!(decoded, ClientMessage::leave_room("org:acme"));

        let out = encode_json(&ServerMessage::RoomLeft {
            room: "org:acme".to_string(),
        })
        .unwrap();
        assert!(out.contains("\"room_left\""));
    }

    #[test]
    fn test_json_rejects_unknown_type() {
        let text = r#"{"type":"teleport","data":{}}"#;
        assert!(matches!(
            decode_json::<ClientMessage>(text),
            Err(ProtocolError::Json(_))
        ));
    }
}
