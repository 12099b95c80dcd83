//! JSON envelopes exchanged with the live speech service

use serde::{Deserialize, Serialize};

use super::LiveConfig;

/// Requested response modality
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Modality {
    Text,
    Audio,
}

/// Inline media payload: base64 data plus its MIME type
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// One outbound chunk of microphone audio
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RealtimeInput {
    pub media: Blob,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub turn_complete: Option<bool>,
    #[serde(default)]
    pub interrupted: Option<bool>,
}

/// Inbound message from the live service
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_content: Option<ServerContent>,
}

impl ServerMessage {
    /// A model turn carrying one inline audio part
    pub fn audio(mime_type: &str, data: String) -> Self {
        Self {
            setup_complete: None,
            server_content: Some(ServerContent {
                model_turn: Some(Content {
                    parts: vec![Part {
                        text: None,
                        inline_data: Some(Blob {
                            mime_type: mime_type.to_string(),
                            data,
                        }),
                    }],
                }),
                ..ServerContent::default()
            }),
        }
    }

    /// Base64 audio in the first part of the model turn, if any
    pub fn audio_data(&self) -> Option<&str> {
        self.server_content
            .as_ref()?
            .model_turn
            .as_ref()?
            .parts
            .first()?
            .inline_data
            .as_ref()
            .map(|blob| blob.data.as_str())
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    pub fn is_turn_complete(&self) -> bool {
        self.server_content
            .as_ref()
            .and_then(|c| c.turn_complete)
            .unwrap_or(false)
    }

    pub fn is_interrupted(&self) -> bool {
        self.server_content
            .as_ref()
            .and_then(|c| c.interrupted)
            .unwrap_or(false)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<Modality>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunks {
    pub media_chunks: Vec<Blob>,
}

/// Outbound websocket envelope
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(MediaChunks),
}

impl ClientMessage {
    /// First message of a session: model, modalities and system instruction
    pub fn setup(config: &LiveConfig) -> Self {
        let model = if config.model.starts_with("models/") {
            config.model.clone()
        } else {
            format!("models/{}", config.model)
        };

        Self::Setup(Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: config.response_modalities.clone(),
            },
            system_instruction: Content {
                parts: vec![Part {
                    text: Some(config.system_instruction.clone()),
                    inline_data: None,
                }],
            },
        })
    }

    pub fn realtime(input: RealtimeInput) -> Self {
        Self::RealtimeInput(MediaChunks {
            media_chunks: vec![input.media],
        })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
