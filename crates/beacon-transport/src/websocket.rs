//! WebSocket transport implementation.
//!
//! Wraps a socket upgraded by axum. Binary frames carry length-prefixed
//! MessagePack, text frames carry JSON; the server replies in the format
//! negotiated at upgrade time.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use beacon_protocol::{codec, ClientMessage, ServerMessage};
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tracing::{debug, warn};

use crate::traits::{
    Connection, ConnectionId, MessageSink, MessageStream, TransportError, WireFormat,
};

/// WebSocket connection settings.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// Outbound encoding.
    pub format: WireFormat,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024, // 64 KB
            format: WireFormat::Binary,
        }
    }
}

/// A WebSocket connection.
pub struct WebSocketConnection {
    id: ConnectionId,
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
    credential: Option<String>,
    config: WebSocketConfig,
}

impl WebSocketConnection {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket, config: WebSocketConfig) -> Self {
        Self {
            id: ConnectionId::generate(),
            socket,
            remote_addr: None,
            credential: None,
            config,
        }
    }

    /// Record the peer address.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Record the credential sent with the upgrade request.
    #[must_use]
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }
}

impl Connection for WebSocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }

    fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }

    fn split(self: Box<Self>) -> (Box<dyn MessageSink>, Box<dyn MessageStream>) {
        let (sink, stream) = self.socket.split();
        let sink = WebSocketSink {
            inner: sink,
            format: self.config.format,
            closed: false,
        };
        let stream = WebSocketStream {
            inner: stream,
            read_buffer: BytesMut::with_capacity(4096),
            max_message_size: self.config.max_message_size,
        };
        (Box::new(sink), Box::new(stream))
    }
}

/// Outbound half of a WebSocket connection.
pub struct WebSocketSink {
    inner: SplitSink<WebSocket, Message>,
    format: WireFormat,
    closed: bool,
}

#[async_trait]
impl MessageSink for WebSocketSink {
    async fn send(&mut self, message: ServerMessage) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        let frame = encode_message(self.format, &message)?;
        self.inner
            .send(frame)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        self.inner
            .close()
            .await
            .map_err(|e| TransportError::CloseFailed(e.to_string()))
    }
}

/// Inbound half of a WebSocket connection.
pub struct WebSocketStream {
    inner: SplitStream<WebSocket>,
    read_buffer: BytesMut,
    max_message_size: usize,
}

#[async_trait]
impl MessageStream for WebSocketStream {
    async fn recv(&mut self) -> Result<Option<ClientMessage>, TransportError> {
        // A previous binary frame may have carried more than one message.
        if let Some(message) = take_binary(&mut self.read_buffer)? {
            return Ok(Some(message));
        }

        loop {
            match self.inner.next().await {
                Some(Ok(Message::Binary(data))) => {
                    if let Some(message) =
                        decode_binary(&mut self.read_buffer, &data, self.max_message_size)?
                    {
                        return Ok(Some(message));
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    return decode_text(&text, self.max_message_size).map(Some);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    // Pings are answered by the socket itself.
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket error");
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }
}

fn encode_message(format: WireFormat, message: &ServerMessage) -> Result<Message, TransportError> {
    Ok(match format {
        WireFormat::Binary => Message::Binary(codec::encode(message)?.to_vec()),
        WireFormat::Json => Message::Text(codec::encode_json(message)?),
    })
}

fn take_binary(buffer: &mut BytesMut) -> Result<Option<ClientMessage>, TransportError> {
    match codec::decode_from(buffer) {
        Ok(message) => Ok(message),
        Err(err) => {
            // The rest of the buffer cannot be re-synchronised.
            buffer.clear();
            Err(err.into())
        }
    }
}

fn decode_binary(
    buffer: &mut BytesMut,
    data: &[u8],
    limit: usize,
) -> Result<Option<ClientMessage>, TransportError> {
    let size = buffer.len() + data.len();
    if size > limit {
        buffer.clear();
        return Err(TransportError::MessageTooLarge { size, limit });
    }
    buffer.extend_from_slice(data);
    take_binary(buffer)
}

fn decode_text(text: &str, limit: usize) -> Result<ClientMessage, TransportError> {
    if text.len() > limit {
        return Err(TransportError::MessageTooLarge {
            size: text.len(),
            limit,
        });
    }
    Ok(codec::decode_json(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(config.max_message_size, 64 * 1024);
        assert_eq!(config.format, WireFormat::Binary);
    }

    #[test]
    fn test_binary_frames_may_be_split() {
        let encoded = codec::encode(&ClientMessage::join_room("org:acme")).unwrap();
        let (head, tail) = encoded.split_at(3);
        let mut buffer = BytesMut::new();

        assert!(decode_binary(&mut buffer, head, 1024).unwrap().is_none());
        let message = decode_binary(&mut buffer, tail, 1024).unwrap();
        assert_eq!(message, Some(ClientMessage::join_room("org:acme")));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_two_messages_in_one_frame() {
        let mut frame = BytesMut::new();
        codec::encode_into(&ClientMessage::heartbeat(), &mut frame).unwrap();
        codec::encode_into(&ClientMessage::leave_room("org:acme"), &mut frame).unwrap();

        let mut buffer = BytesMut::new();
        let first = decode_binary(&mut buffer, &frame, 1024).unwrap();
        assert_eq!(first, Some(ClientMessage::heartbeat()));
        let second = take_binary(&mut buffer).unwrap();
        assert_eq!(second, Some(ClientMessage::leave_room("org:acme")));
    }

    #[test]
    fn test_oversized_message_is_rejected() {
        let mut buffer = BytesMut::new();
        let err = decode_binary(&mut buffer, &[0u8; 32], 16).unwrap_err();
        assert!(matches!(err, TransportError::MessageTooLarge { size: 32, limit: 16 }));
        assert!(err.is_recoverable());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_json_text_frames() {
        let text = r#"{"type":"leave_room","data":{"room":"org:acme"}}"#;
        let message = decode_text(text, 1024).unwrap();
        assert_eq!(message, ClientMessage::leave_room("org:acme"));

        let err = decode_text("{not json", 1024).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_outbound_format() {
        let message = ServerMessage::room_joined("org:acme");
        assert!(matches!(
            encode_message(WireFormat::Binary, &message).unwrap(),
            Message::Binary(_)
        ));
        match encode_message(WireFormat::Json, &message).unwrap() {
            Message::Text(text) => assert!(text.contains("room_join_result")),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
