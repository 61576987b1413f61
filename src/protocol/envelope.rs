//! Wire envelope and message types.
//!
//! This module defines the unit exchanged over the transport: an [`Envelope`]
//! carrying a stream cursor plus an ordered batch of messages, each of which
//! is either a server-initiated call or the result of a client invocation.
//!
//! The envelope is serialized as a camelCase JSON object. All fields are
//! optional on the wire; an empty object is a valid keep-alive frame.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One framed unit received from the transport.
///
/// Invariant: `cursor` values observed on a logical connection are strictly
/// increasing. The connection state machine rejects a decrease or repeat as
/// a protocol desync and never delivers the affected messages.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Envelope {
    /// Monotonically increasing message-stream position. Absent on frames
    /// that carry no messages and on the very first frame.
    pub cursor: Option<u64>,

    /// Ordered batch of payload messages.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<InboundMessage>,

    /// Set once, on the first frame of a freshly connected stream.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub initialized: bool,

    /// Opaque group-membership token, echoed back on resume requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups_token: Option<String>,

    /// Fatal error description. Terminates the logical connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Server hint that the client should drop the transport and reconnect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub should_reconnect: Option<bool>,
}

/// A single message inside an envelope.
///
/// The two shapes are distinguished structurally: results carry a
/// `correlationId`, server calls carry a `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InboundMessage {
    /// Reply to a client invocation, matched by correlation id.
    Result(InvocationResult),
    /// Server-initiated call with no correlation id.
    ServerCall(ServerCall),
}

/// A server-to-client method call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCall {
    /// Qualified method name, `Hub.Method`.
    pub target: String,
    #[serde(default)]
    pub args: Vec<Value>,
    /// Per-hub state entries updated by this call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<HashMap<String, Value>>,
}

impl ServerCall {
    /// Splits the qualified target into `(hub, method)`.
    pub fn split_target(&self) -> Option<(&str, &str)> {
        self.target.split_once('.')
    }

    /// The hub part of the target, when qualified.
    pub fn hub(&self) -> Option<&str> {
        self.split_target().map(|(hub, _)| hub)
    }
}

/// The result of a client invocation, success or failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResult {
    pub correlation_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Per-hub state entries updated by this result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<HashMap<String, Value>>,
}

/// An outbound invocation frame, client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundFrame {
    pub correlation_id: u64,
    /// Qualified method name, `Hub.Method`.
    pub target: String,
    pub args: Vec<Value>,
    /// Current state of the target hub, so the server can detect staleness.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<HashMap<String, Value>>,
    /// Echoed on every frame sent during or after a reconnect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups_token: Option<String>,
}
