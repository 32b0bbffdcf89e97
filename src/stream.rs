//! The duplex message channel between one client and its agent.
//!
//! Transports deliver inbound traffic either as raw text (parsed as JSON by
//! the agent) or as already-parsed records; outbound traffic is always a
//! record, serialized however the transport frames it. [`pipe`] gives an
//! in-process implementation for embedding and tests; the WebSocket
//! adapter lives in [`crate::server`].

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::protocol::ProtocolError;

/// One inbound message, in whichever form the transport delivers it.
#[derive(Debug, Clone)]
pub enum WireMessage {
    /// Raw text; the agent parses it as JSON.
    Text(String),
    /// An already-parsed record.
    Record(Value),
}

/// A duplex, message-oriented channel to one client.
#[async_trait]
pub trait MessageStream: Send {
    /// Next inbound message. `None` means the client is gone.
    async fn recv(&mut self) -> Option<Result<WireMessage, ProtocolError>>;

    /// Write one record to the client.
    async fn send(&mut self, record: Value) -> Result<(), ProtocolError>;
}

/// Build an in-process duplex pair: the server half an agent pumps, and the
/// client half a test or embedder drives.
pub fn pipe() -> (PipeStream, PipeHandle) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    (
        PipeStream {
            inbound: inbound_rx,
            outbound: outbound_tx,
        },
        PipeHandle {
            inbound: Some(inbound_tx),
            outbound: outbound_rx,
        },
    )
}

/// The server half of an in-process pipe.
pub struct PipeStream {
    inbound: mpsc::UnboundedReceiver<WireMessage>,
    outbound: mpsc::UnboundedSender<Value>,
}

#[async_trait]
impl MessageStream for PipeStream {
    async fn recv(&mut self) -> Option<Result<WireMessage, ProtocolError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn send(&mut self, record: Value) -> Result<(), ProtocolError> {
        self.outbound
            .send(record)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}

/// The client half of an in-process pipe.
pub struct PipeHandle {
    inbound: Option<mpsc::UnboundedSender<WireMessage>>,
    outbound: mpsc::UnboundedReceiver<Value>,
}

impl PipeHandle {
    /// Send a record to the agent. Returns false once the agent is gone.
    pub fn send(&self, record: Value) -> bool {
        self.inbound
            .as_ref()
            .map(|tx| tx.send(WireMessage::Record(record)).is_ok())
            .unwrap_or(false)
    }

    /// Send raw text to the agent, exercising its JSON parsing.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.inbound
            .as_ref()
            .map(|tx| tx.send(WireMessage::Text(text.into())).is_ok())
            .unwrap_or(false)
    }

    /// End the client→agent direction; the agent sees the stream end.
    /// The agent→client direction stays readable.
    pub fn close(&mut self) {
        self.inbound = None;
    }

    /// Next record written by the agent. `None` once the agent is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        self.outbound.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_pipe_round_trip() {
        let (mut server, mut client) = pipe();
        assert!(client.send(json!({"a": "sub"})));
        match server.recv().await {
            Some(Ok(WireMessage::Record(record))) => assert_eq!(record, json!({"a": "sub"})),
            other => panic!("expected record, got {other:?}"),
        }
        server.send(json!({"a": "init"})).await.unwrap();
        assert_eq!(client.recv().await, Some(json!({"a": "init"})));
    }

    #[tokio::test]
    async fn test_pipe_close_ends_server_side() {
        let (mut server, mut client) = pipe();
        client.close();
        assert!(server.recv().await.is_none());
        assert!(!client.send(json!({})));
    }

    #[tokio::test]
    async fn test_pipe_server_drop_ends_client_side() {
        let (server, mut client) = pipe();
        drop(server);
        assert!(client.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_pipe_text_passthrough() {
        let (mut server, client) = pipe();
        assert!(client.send_text("{\"a\":\"sub\"}"));
        match server.recv().await {
            Some(Ok(WireMessage::Text(text))) => assert_eq!(text, "{\"a\":\"sub\"}"),
            other => panic!("expected text, got {other:?}"),
        }
    }
}
