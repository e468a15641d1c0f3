//! Wire framing: one JSON envelope object per text frame.

use runner_shell_core::{Envelope, TransportError};

/// Encode an envelope as a text frame.
///
/// # Errors
/// Returns error if the envelope cannot be serialized.
pub fn encode(envelope: &Envelope) -> Result<String, TransportError> {
    envelope
        .to_line()
        .map_err(|e| TransportError::Send(format!("encode failed: {e}")))
}

/// Decode a text frame into an envelope.
///
/// Only the JSON shape is checked here; structural rules are left to the
/// validator.
///
/// # Errors
/// Returns [`TransportError::Decode`] if the frame is not a JSON object.
pub fn decode(frame: &str) -> Result<Envelope, TransportError> {
    serde_json::from_str(frame).map_err(|e| TransportError::Decode(e.to_string()))
}
