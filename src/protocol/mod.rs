//! Wire protocol: envelope model and JSON codec.

mod codec;
mod envelope;

pub use codec::{EnvelopeCodec, ProtocolError};
pub use envelope::{Envelope, InboundMessage, InvocationResult, OutboundFrame, ServerCall};
