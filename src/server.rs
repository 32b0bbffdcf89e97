//! WebSocket front end: one agent per connection.
//!
//! The server owns nothing but the listener and a shared [`Backend`];
//! every accepted connection gets its own [`Agent`] on its own task, and
//! the agent owns all per-connection state from there.
//!
//! ```text
//! Client A ──┐
//!             ├── TcpListener ── accept ── Agent (per connection) ── Backend
//! Client B ──┘                                                        (shared)
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::agent::Agent;
use crate::backend::Backend;
use crate::protocol::ProtocolError;
use crate::stream::{MessageStream, WireMessage};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9050".to_string(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
}

/// The session server.
pub struct SessionServer {
    config: ServerConfig,
    backend: Arc<dyn Backend>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SessionServer {
    /// Create a new session server over the given Backend.
    pub fn new(config: ServerConfig, backend: Arc<dyn Backend>) -> Self {
        Self {
            config,
            backend,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server accept loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("session server listening on {}", self.config.bind_addr);

        loop {
            let (tcp, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let backend = self.backend.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                {
                    let mut s = stats.write().await;
                    s.total_connections += 1;
                    s.active_connections += 1;
                }

                match tokio_tungstenite::accept_async(tcp).await {
                    Ok(ws) => {
                        let agent = Agent::new(backend, Box::new(WsStream::new(ws)));
                        let client_id = agent.client_id().to_string();
                        log::info!("client {client_id} connected from {addr}");
                        match agent.run().await {
                            Ok(()) => log::info!("client {client_id} disconnected"),
                            Err(err) => {
                                log::error!("session {client_id} from {addr} closed: {err}")
                            }
                        }
                    }
                    Err(err) => log::warn!("websocket handshake failed from {addr}: {err}"),
                }

                let mut s = stats.write().await;
                s.active_connections -= 1;
            });
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

/// A WebSocket connection as a [`MessageStream`]: text frames in, JSON
/// text frames out.
struct WsStream {
    ws: WebSocketStream<TcpStream>,
}

impl WsStream {
    fn new(ws: WebSocketStream<TcpStream>) -> Self {
        Self { ws }
    }
}

#[async_trait]
impl MessageStream for WsStream {
    async fn recv(&mut self) -> Option<Result<WireMessage, ProtocolError>> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Some(Ok(WireMessage::Text(text.to_string())))
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = self.ws.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => return None,
                // Binary and pong frames are not part of the protocol.
                Some(Ok(_)) => {}
                Some(Err(err)) => return Some(Err(ProtocolError::Transport(err.to_string()))),
            }
        }
    }

    async fn send(&mut self, record: Value) -> Result<(), ProtocolError> {
        let text = serde_json::to_string(&record)
            .map_err(|e| ProtocolError::Serialize(e.to_string()))?;
        self.ws
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}
