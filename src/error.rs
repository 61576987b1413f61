use thiserror::Error;

/// Errors that can occur in the hub client engine.
///
/// Failures detected inside the receive path are never thrown at callers;
/// they drive state transitions and resolve pending invocation handles.
/// Only `start`, `invoke` and the handles themselves return errors.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The bootstrap exchange failed or returned an unusable response.
    /// Fatal: not retried, the caller must restart the connection.
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    /// The duplex transport failed. Retried per the reconnect policy.
    #[error("transport error: {0}")]
    Transport(String),

    /// A payload could not be decoded into an envelope. Recoverable: the
    /// frame is dropped and logged.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[from] crate::protocol::ProtocolError),

    /// The message-stream cursor regressed or repeated. Forces a reconnect.
    #[error("protocol desync: {0}")]
    ProtocolDesync(String),

    /// The server rejected an invocation.
    #[error("server error: {0}")]
    Server(String),

    /// The logical connection was torn down. Delivered to every pending
    /// invocation handle exactly once.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("not connected")]
    NotConnected,

    /// The operation is not valid in the current lifecycle state, e.g.
    /// starting a connection that is already running.
    #[error("invalid state: {0}")]
    InvalidState(String),
}
