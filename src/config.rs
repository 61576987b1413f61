//! Client configuration.
//!
//! Everything the engine needs to know before negotiation: the endpoint,
//! extra query parameters and headers passed through on every request, and
//! the tunables for heartbeat and reconnection.

use std::collections::HashMap;

use url::Url;

use crate::connection::retry::ReconnectPolicy;
use crate::error::ClientError;

/// Configuration for a logical hub connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base endpoint URL, e.g. `https://example.org/signalr`.
    pub url: Url,
    /// Raw query string appended to every negotiation and connect request.
    pub query_string: Option<String>,
    /// Headers added to every request, e.g. opaque auth tokens.
    pub headers: HashMap<String, String>,
    /// Multiplier applied to the negotiated keep-alive interval to derive
    /// the possibly-dead heartbeat threshold.
    pub heartbeat_factor: u32,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    /// Creates a configuration for the given endpoint URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL does not parse.
    pub fn new(url: &str) -> Result<Self, ClientError> {
        Ok(Self {
            url: Url::parse(url)?,
            query_string: None,
            headers: HashMap::new(),
            heartbeat_factor: 2,
            reconnect: ReconnectPolicy::default(),
        })
    }

    /// Appends a raw query string to every request.
    pub fn with_query_string(mut self, query: impl Into<String>) -> Self {
        self.query_string = Some(query.into());
        self
    }

    /// Adds a header sent on every request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_heartbeat_factor(mut self, factor: u32) -> Self {
        self.heartbeat_factor = factor;
        self
    }
}
