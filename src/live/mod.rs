//! Live bidirectional channel to the conversational speech service

mod gemini;
mod protocol;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::VoiceError;

pub use gemini::{GeminiLiveConnector, LIVE_ENDPOINT};
pub use protocol::{
    Blob, ClientMessage, Content, Modality, Part, RealtimeInput, ServerContent, ServerMessage,
};

/// Session parameters sent when the channel opens
#[derive(Clone, Debug, PartialEq)]
pub struct LiveConfig {
    pub model: String,
    pub response_modalities: Vec<Modality>,
    pub system_instruction: String,
}

impl LiveConfig {
    /// Audio-only responses
    pub fn audio(model: &str, system_instruction: &str) -> Self {
        Self {
            model: model.to_string(),
            response_modalities: vec![Modality::Audio],
            system_instruction: system_instruction.to_string(),
        }
    }
}

/// Lifecycle and data notifications from a live channel
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelEvent {
    /// The service acknowledged the session setup
    Opened,
    Message(ServerMessage),
    /// The channel closed after opening
    Closed { reason: Option<String> },
    /// The channel failed (before or after opening)
    Failed(String),
}

/// Opens live channels
#[async_trait]
pub trait LiveConnector: Send + Sync {
    /// Establish the connection and send the session setup.
    /// `Opened` is delivered on `events` once the service acknowledges it.
    async fn connect(
        &self,
        config: LiveConfig,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Result<Box<dyn LiveLink>, VoiceError>;
}

/// Outbound half of an open channel
#[async_trait]
pub trait LiveLink: Send {
    async fn send(&mut self, input: RealtimeInput) -> Result<(), VoiceError>;
    async fn close(&mut self);
}
