//! High-level hub client.
//!
//! [`HubClient`] is the caller-facing facade over [`Connection`]: it owns
//! the transport, serializes invocation arguments and exposes the
//! connection-state notification stream.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionState, InvocationHandle};
use crate::error::ClientError;
use crate::protocol::ProtocolError;
use crate::transport::{Transport, WebSocketTransport};

/// Client for a persistent, server-pushed hub connection.
///
/// # Example
///
/// ```no_run
/// use hubwire::{ClientConfig, HubClient};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ClientConfig::new("https://example.org/signalr")?;
/// let client = HubClient::new(config);
///
/// client
///     .on("Chat", "Receive", |args| println!("received: {args:?}"))
///     .await;
/// client.start().await?;
///
/// let handle = client.invoke("Chat", "Send", &["hi"]).await?;
/// let reply: String = handle.result_as().await?;
/// println!("server said: {reply}");
///
/// client.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct HubClient {
    connection: Connection,
}

impl HubClient {
    /// Creates a client over the production WebSocket transport.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_transport(config, Arc::new(WebSocketTransport::new()))
    }

    /// Creates a client over a custom transport. Used for in-memory
    /// transports in tests and for instrumented adapters.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            connection: Connection::new(config, transport),
        }
    }

    /// Negotiates and connects, returning once the stream is active.
    ///
    /// After a `Disconnected` (explicit stop, fatal server error or an
    /// exhausted reconnect budget) call `start` again to perform a fresh
    /// negotiation.
    pub async fn start(&self) -> Result<(), ClientError> {
        self.connection.start().await
    }

    /// Invokes a hub method. The returned handle resolves with the
    /// correlated result; the call itself only enqueues.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] unless the connection is
    /// active, or a serialization error for unencodable arguments.
    pub async fn invoke<T: Serialize>(
        &self,
        hub: &str,
        method: &str,
        args: &[T],
    ) -> Result<InvocationHandle, ClientError> {
        let args = args
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<Value>, _>>()
            .map_err(|e| ClientError::MalformedEnvelope(ProtocolError::Encode(e)))?;
        self.connection.invoke(hub, method, args).await
    }

    /// Registers a handler for server-initiated calls on `(hub, method)`.
    ///
    /// Handlers run on a dispatch task decoupled from the receive loop; a
    /// slow handler delays later server calls but never heartbeats.
    pub async fn on<F>(&self, hub: &str, method: &str, handler: F)
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        self.connection.on(hub, method, handler).await;
    }

    /// Stops the connection. Idempotent; all pending invocation handles are
    /// resolved with a connection-lost error before this returns.
    pub async fn stop(&self) {
        self.connection.stop().await;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Stream of lifecycle state changes.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.connection.state_changes()
    }
}
