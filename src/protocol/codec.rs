//! JSON codec for wire envelopes.
//!
//! Decodes one transport payload into an [`Envelope`] and encodes outbound
//! invocation frames. A payload that fails to decode is a recoverable
//! per-message error: the connection logs it and drops the frame.

use serde_json::Value;

use crate::protocol::{Envelope, OutboundFrame};

/// Errors that can occur during envelope encoding or decoding.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    /// The payload is not valid JSON or is missing a well-typed field.
    #[error("JSON decode error: {0}")]
    Decode(#[source] serde_json::Error),

    /// An outbound frame could not be serialized.
    #[error("JSON encode error: {0}")]
    Encode(#[source] serde_json::Error),

    /// The payload decoded to something other than an object.
    #[error("payload is not a JSON object")]
    NotAnObject,
}

/// Codec for the JSON envelope format.
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    /// Decodes a transport payload into an [`Envelope`].
    ///
    /// An empty object (`{}`) is a valid keep-alive envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a JSON object or a field has
    /// the wrong type.
    pub fn decode(payload: &str) -> Result<Envelope, ProtocolError> {
        let value: Value = serde_json::from_str(payload).map_err(ProtocolError::Decode)?;
        if !value.is_object() {
            return Err(ProtocolError::NotAnObject);
        }
        serde_json::from_value(value).map_err(ProtocolError::Decode)
    }

    /// Encodes an outbound invocation frame into a transport payload.
    pub fn encode(frame: &OutboundFrame) -> Result<String, ProtocolError> {
        serde_json::to_string(frame).map_err(ProtocolError::Encode)
    }
}
