use thiserror::Error;

/// Errors surfaced by the voice session core
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VoiceError {
    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Live channel failed to open: {0}")]
    ChannelOpenFailure(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Failed to transmit frame: {0}")]
    TransmitFailure(String),
    #[error("A voice session is already active")]
    SessionActive,
    #[error("Config error: {0}")]
    Config(String),
}

impl From<base64::DecodeError> for VoiceError {
    fn from(err: base64::DecodeError) -> Self {
        Self::Decode(err.to_string())
    }
}
