//! Transport adapter seam.
//!
//! The engine treats the transport as black-box framing: one payload per
//! envelope, delivered alongside lifecycle events. A fresh adapter instance
//! is opened for every connect attempt; adapters are never reused.

mod websocket;

pub use websocket::WebSocketTransport;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use url::Url;

use crate::config::ClientConfig;
use crate::connection::ConnectionDescriptor;
use crate::error::ClientError;
use crate::negotiate::{self, NegotiationResponse, PROTOCOL_VERSION};

/// Lifecycle events delivered by an open transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One wire payload, carrying exactly one envelope.
    Payload(String),
    /// The underlying connection closed, with the peer's reason if any.
    Closed(Option<String>),
    /// The underlying connection failed.
    Error(String),
}

/// Channels handed back by a successfully opened transport.
///
/// Dropping `outbound` or signalling `stop` shuts the adapter down; the
/// engine does both on teardown and then discards the instance.
pub struct TransportChannels {
    /// Outbound payloads, one envelope each.
    pub outbound: mpsc::UnboundedSender<String>,
    /// Inbound payloads and lifecycle events.
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
    /// Send `true` to stop the adapter.
    pub stop: watch::Sender<bool>,
}

/// Whether an open is the initial connect or a stream resumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectAction {
    Connect,
    Reconnect,
}

impl ConnectAction {
    fn path_segment(self) -> &'static str {
        match self {
            ConnectAction::Connect => "connect",
            ConnectAction::Reconnect => "reconnect",
        }
    }
}

/// Parameters for opening one duplex connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub url: Url,
    pub headers: HashMap<String, String>,
}

/// A pluggable duplex transport.
///
/// Implementations perform the bootstrap negotiation exchange and open the
/// message-oriented duplex connection. The production implementation is
/// [`WebSocketTransport`]; tests substitute an in-memory one.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs the negotiation exchange over the bootstrap channel.
    async fn negotiate(&self, config: &ClientConfig) -> Result<NegotiationResponse, ClientError>;

    /// Opens a new duplex connection. Called once per attempt; the returned
    /// channels belong to this attempt only.
    async fn open(&self, request: ConnectRequest) -> Result<TransportChannels, ClientError>;
}

/// Builds the duplex-connection URL for a connect or resume attempt.
///
/// Echoes the connection token and id from negotiation and, on resume, the
/// last consumed cursor and the groups token, so the server can continue
/// the stream without gaps or duplicates.
pub fn receive_url(
    config: &ClientConfig,
    descriptor: &ConnectionDescriptor,
    action: ConnectAction,
    cursor: Option<u64>,
    groups_token: Option<&str>,
) -> Result<Url, ClientError> {
    let mut url = config.url.clone();

    let ws_scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(ws_scheme)
        .map_err(|_| ClientError::Transport(format!("cannot derive ws scheme for {url}")))?;

    let mut path = url.path().to_string();
    if path.ends_with('/') && path.len() > 1 {
        path.pop();
    }
    path.push('/');
    path.push_str(action.path_segment());
    url.set_path(&path);
    url.set_fragment(None);

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("transport", "webSockets");
        query.append_pair("clientProtocol", PROTOCOL_VERSION);
        query.append_pair("connectionToken", &descriptor.connection_token);
        query.append_pair("connectionId", &descriptor.connection_id);
        if let Some(cursor) = cursor {
            query.append_pair("messageId", &cursor.to_string());
        }
        if let Some(token) = groups_token {
            query.append_pair("groupsToken", token);
        }
    }
    negotiate::append_raw_query(&mut url, config.query_string.as_deref());

    Ok(url)
}
