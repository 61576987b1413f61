//! WebSocket transport adapter.
//!
//! Wraps one `tokio-tungstenite` connection behind the [`Transport`]
//! contract: negotiation over HTTP, then a background task that pumps
//! payloads and lifecycle events through channels until stopped.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use http::header::{HeaderName, HeaderValue};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, Message},
};
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::negotiate::{self, NegotiationResponse};
use crate::transport::{ConnectRequest, Transport, TransportChannels, TransportEvent};

/// Production transport over WebSocket.
#[derive(Default)]
pub struct WebSocketTransport {
    http: reqwest::Client,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn negotiate(&self, config: &ClientConfig) -> Result<NegotiationResponse, ClientError> {
        negotiate::negotiate(&self.http, config).await
    }

    async fn open(&self, request: ConnectRequest) -> Result<TransportChannels, ClientError> {
        debug!("WebSocket URL: {}", request.url);

        let mut ws_request = request.url.as_str().into_client_request()?;
        for (name, value) in &request.headers {
            ws_request.headers_mut().insert(
                HeaderName::from_bytes(name.as_bytes()).map_err(http::Error::from)?,
                HeaderValue::from_str(value).map_err(http::Error::from)?,
            );
        }

        let (ws_stream, _) = connect_async(ws_request).await?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        tokio::spawn(pump(ws_stream, outbound_rx, event_tx, stop_rx));

        Ok(TransportChannels {
            outbound: outbound_tx,
            events: event_rx,
            stop: stop_tx,
        })
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Drives one WebSocket until the peer closes, an error occurs, or the
/// engine signals stop. Owns the stream; the engine only sees channels.
async fn pump(
    mut ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => {
                if *stop.borrow() {
                    let _ = ws.close(None).await;
                    break;
                }
            }
            payload = outbound.recv() => match payload {
                Some(payload) => {
                    if let Err(e) = ws.send(Message::text(payload)).await {
                        warn!("WebSocket send failed: {}", e);
                        let _ = events.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                }
                // Engine dropped the sender; treat as a stop.
                None => {
                    let _ = ws.close(None).await;
                    break;
                }
            },
            message = ws.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(TransportEvent::Payload(text.to_string()));
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = ws.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Binary(_))) => {
                    debug!("Ignoring unexpected binary frame");
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.to_string());
                    let _ = events.send(TransportEvent::Closed(reason));
                    break;
                }
                Some(Err(e)) => {
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                    break;
                }
                None => {
                    let _ = events.send(TransportEvent::Closed(None));
                    break;
                }
            },
        }
    }
}
