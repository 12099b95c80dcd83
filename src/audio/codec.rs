//! Text-safe framing for raw audio bytes carried in JSON envelopes

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::VoiceError;

/// Encode raw bytes as padded base64
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode padded base64 back to the original bytes
pub fn decode(text: &str) -> Result<Vec<u8>, VoiceError> {
    Ok(STANDARD.decode(text)?)
}
