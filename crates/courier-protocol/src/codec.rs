//! Codec for encoding and decoding courier envelopes.
//!
//! Frames travel as JSON text over the transport's text-frame channel; the
//! transport owns framing, so the codec is a plain string <-> envelope pair
//! with a size guard.

use thiserror::Error;

use crate::envelope::Message;

/// Maximum encoded frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON encoding/decoding error.
    #[error("Codec error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode an envelope to a JSON text frame.
///
/// # Errors
///
/// Returns an error if the envelope is too large or serialization fails.
pub fn encode(message: &Message) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(message)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode an envelope from a JSON text frame.
///
/// Unknown fields are ignored; absent fields decode to their defaults.
///
/// # Errors
///
/// Returns an error if the frame is too large or not a valid envelope.
pub fn decode(text: &str) -> Result<Message, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}
