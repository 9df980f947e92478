//! In-memory transport.
//!
//! Connects a client handle and a server-side [`Connection`] through tokio
//! channels. Used by tests and by embedders that run the engine in-process.

use async_trait::async_trait;
use beacon_protocol::{ClientMessage, ServerMessage};
use tokio::sync::{mpsc, Mutex};

use crate::traits::{
    Connection, ConnectionId, MessageSink, MessageStream, Transport, TransportError,
};

const CHANNEL_CAPACITY: usize = 256;

/// Create a connected pair.
#[must_use]
pub fn pair(id: impl Into<ConnectionId>) -> (MemoryConnection, MemoryClient) {
    pair_with_credential(id, None)
}

/// Create a connected pair whose server side presents `credential`.
#[must_use]
pub fn pair_with_credential(
    id: impl Into<ConnectionId>,
    credential: Option<String>,
) -> (MemoryConnection, MemoryClient) {
    let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let connection = MemoryConnection {
        id: id.into(),
        credential,
        inbound: inbound_rx,
        outbound: outbound_tx,
    };
    let client = MemoryClient {
        sender: Some(inbound_tx),
        receiver: outbound_rx,
    };
    (connection, client)
}

/// Server side of an in-memory pair.
pub struct MemoryConnection {
    id: ConnectionId,
    credential: Option<String>,
    inbound: mpsc::Receiver<ClientMessage>,
    outbound: mpsc::Sender<ServerMessage>,
}

impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }

    fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }

    fn split(self: Box<Self>) -> (Box<dyn MessageSink>, Box<dyn MessageStream>) {
        let sink = MemorySink {
            outbound: Some(self.outbound),
        };
        let stream = MemoryStream {
            inbound: self.inbound,
        };
        (Box::new(sink), Box::new(stream))
    }
}

struct MemorySink {
    outbound: Option<mpsc::Sender<ServerMessage>>,
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn send(&mut self, message: ServerMessage) -> Result<(), TransportError> {
        let outbound = self.outbound.as_ref().ok_or(TransportError::ConnectionClosed)?;
        outbound
            .send(message)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.outbound = None;
        Ok(())
    }
}

struct MemoryStream {
    inbound: mpsc::Receiver<ClientMessage>,
}

#[async_trait]
impl MessageStream for MemoryStream {
    async fn recv(&mut self) -> Result<Option<ClientMessage>, TransportError> {
        Ok(self.inbound.recv().await)
    }
}

/// Client side of an in-memory pair.
pub struct MemoryClient {
    sender: Option<mpsc::Sender<ClientMessage>>,
    receiver: mpsc::Receiver<ServerMessage>,
}

impl MemoryClient {
    /// Send a message to the server.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` once either side has closed.
    pub async fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        let sender = self.sender.as_ref().ok_or(TransportError::ConnectionClosed)?;
        sender
            .send(message)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Receive the next server message, or `None` once the server closed.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.receiver.recv().await
    }

    /// Receive a message if one is already queued.
    pub fn try_recv(&mut self) -> Option<ServerMessage> {
        self.receiver.try_recv().ok()
    }

    /// Close the client's half; the server sees end of stream.
    pub fn close(&mut self) {
        self.sender = None;
    }
}

/// A transport whose connections are created in-process.
pub struct MemoryTransport {
    sender: mpsc::Sender<MemoryConnection>,
    receiver: Mutex<mpsc::Receiver<MemoryConnection>>,
}

impl MemoryTransport {
    /// Create a transport.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    /// Open a connection presenting `credential`; it is handed out by the
    /// next `accept`.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` if the accept side is gone.
    pub async fn connect(&self, credential: &str) -> Result<MemoryClient, TransportError> {
        let (connection, client) =
            pair_with_credential(ConnectionId::generate(), Some(credential.to_string()));
        self.sender
            .send(connection)
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;
        Ok(client)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        let mut receiver = self.receiver.lock().await;
        match receiver.recv().await {
            Some(connection) => Ok(Box::new(connection)),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_round_trip() {
        let (connection, mut client) = pair("conn_test");
        assert_eq!(connection.id().as_str(), "conn_test");
        let (mut sink, mut stream) = Box::new(connection).split();

        client.send(ClientMessage::heartbeat()).await.unwrap();
        assert_eq!(
            stream.recv().await.unwrap(),
            Some(ClientMessage::heartbeat())
        );

        sink.send(ServerMessage::room_joined("org:acme")).await.unwrap();
        assert_eq!(
            client.recv().await,
            Some(ServerMessage::room_joined("org:acme"))
        );
    }

    #[tokio::test]
    async fn test_close_ends_both_directions() {
        let (connection, mut client) = pair("conn_test");
        let (mut sink, mut stream) = Box::new(connection).split();

        client.close();
        assert_eq!(stream.recv().await.unwrap(), None);
        assert!(client.send(ClientMessage::heartbeat()).await.is_err());

        sink.close().await.unwrap();
        sink.close().await.unwrap();
        assert!(sink.send(ServerMessage::room_joined("x")).await.is_err());
        assert_eq!(client.recv().await, None);
    }

    #[tokio::test]
    async fn test_transport_accepts_in_order() {
        let transport = MemoryTransport::new();
        let _first = transport.connect("token-a").await.unwrap();
        let _second = transport.connect("token-b").await.unwrap();

        let a = transport.accept().await.unwrap();
        let b = transport.accept().await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.credential(), Some("token-a"));
        assert_eq!(b.credential(), Some("token-b"));
        assert_eq!(transport.name(), "memory");
    }
}
