//! Negotiation with the hub server.
//!
//! Before the duplex transport is opened, the client performs an HTTP GET
//! against the `/negotiate` endpoint to obtain a connection token and the
//! timing parameters that govern heartbeat and reconnection.
//!
//! This module handles the negotiation request and parses the response.

use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::config::ClientConfig;
use crate::error::ClientError;

/// Protocol version this engine speaks. Verified against the server's
/// `protocolVersion` before the transport is started.
pub const PROTOCOL_VERSION: &str = "1.5";

/// Response from the `/negotiate` endpoint. Only the fields consumed by the
/// engine are modeled; everything else is ignored.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationResponse {
    pub connection_token: String,
    pub connection_id: String,
    pub protocol_version: String,
    /// Keep-alive interval in seconds. Absent when the server does not send
    /// keep-alive frames.
    #[serde(default)]
    pub keep_alive_timeout: Option<f64>,
    /// Seconds after the last receipt at which the connection is considered
    /// dead.
    pub disconnect_timeout: f64,
    /// Whether the server offers the websocket transport.
    #[serde(default)]
    pub try_web_sockets: bool,
}

/// Builds the negotiation URL: base path plus `/negotiate`, with the client
/// protocol version and any configured query string.
pub fn negotiate_url(config: &ClientConfig) -> Result<Url, ClientError> {
    let mut url = config.url.clone();

    let mut path = url.path().to_string();
    if path.ends_with('/') && path.len() > 1 {
        path.pop();
    }
    path.push_str("/negotiate");
    url.set_path(&path);
    url.set_fragment(None);

    url.query_pairs_mut()
        .append_pair("clientProtocol", PROTOCOL_VERSION);
    append_raw_query(&mut url, config.query_string.as_deref());

    Ok(url)
}

/// Performs the negotiate request.
///
/// # Errors
///
/// Returns [`ClientError::NegotiationFailed`] on a non-success status and
/// propagates request or decode failures. All negotiation errors are fatal:
/// the caller must restart the connection explicitly.
pub async fn negotiate(
    http: &reqwest::Client,
    config: &ClientConfig,
) -> Result<NegotiationResponse, ClientError> {
    let url = negotiate_url(config)?;
    debug!("Negotiate URL: {}", url);

    let mut request = http.get(url.as_str()).header("Accept", "application/json");
    for (name, value) in &config.headers {
        request = request.header(name.as_str(), value.as_str());
    }

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ClientError::NegotiationFailed(format!(
            "negotiate endpoint returned {status}"
        )));
    }

    let negotiation: NegotiationResponse = response
        .json()
        .await
        .map_err(|e| ClientError::NegotiationFailed(format!("malformed response: {e}")))?;

    debug!(
        "Negotiation completed, connection id: {}",
        negotiation.connection_id
    );
    Ok(negotiation)
}

/// Appends a raw, caller-supplied query string to a URL that may already
/// carry query parameters.
pub(crate) fn append_raw_query(url: &mut Url, raw: Option<&str>) {
    if let Some(raw) = raw {
        let combined = match url.query() {
            Some(existing) if !existing.is_empty() => format!("{existing}&{raw}"),
            _ => raw.to_string(),
        };
        url.set_query(Some(&combined));
    }
}
