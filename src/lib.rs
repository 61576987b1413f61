//! Client engine for a persistent, server-pushed hub messaging protocol.
//!
//! This crate implements the client side of a bidirectional messaging
//! protocol layered on a duplex transport: negotiation, envelope framing,
//! heartbeat monitoring, backoff-driven reconnection with stream resumption,
//! and correlation of outbound invocations with inbound results and
//! server-initiated callbacks.
//!
//! # Quick start
//!
//! ```no_run
//! use hubwire::{ClientConfig, HubClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new("https://example.org/signalr")?;
//!     let client = HubClient::new(config);
//!
//!     client.on("Chat", "Receive", |args| println!("{args:?}")).await;
//!     client.start().await?;
//!
//!     let handle = client.invoke("Chat", "Send", &["hi"]).await?;
//!     let reply: String = handle.result_as().await?;
//!     println!("{reply}");
//!
//!     client.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! The connection survives transient transport failures: the stream resumes
//! from the last consumed cursor, so no message is redelivered or skipped.
//! Invocations pending across a reconnect stay pending; they fail with a
//! connection-lost error only when the connection finalizes.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod negotiate;
pub mod protocol;
pub mod transport;

pub use client::HubClient;
pub use config::ClientConfig;
pub use connection::retry::{Backoff, ReconnectPolicy};
pub use connection::{ConnectionDescriptor, ConnectionState, InvocationHandle};
pub use error::ClientError;
pub use negotiate::NegotiationResponse;
pub use protocol::{Envelope, EnvelopeCodec, InboundMessage, OutboundFrame};
pub use transport::{Transport, TransportChannels, TransportEvent, WebSocketTransport};
