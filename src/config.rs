use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::{CaptureFormat, CAPTURE_FRAME_SAMPLES, CAPTURE_SAMPLE_RATE, CHANNELS};
use crate::error::VoiceError;
use crate::live::LIVE_ENDPOINT;
use crate::voice::{OverflowPolicy, SessionFormat, UserContext};

/// Native-audio model used for live conversations
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-12-2025";

/// Placeholder replaced by the username in the instruction template
const USERNAME_PLACEHOLDER: &str = "{username}";

const DEFAULT_INSTRUCTION: &str =
    "You are a task management helper for {username}. Speak the language the user speaks.";

/// Environment variables checked, in order, for the API key
const API_KEY_VARS: [&str; 2] = ["GEMINI_API_KEY", "API_KEY"];

/// Voice session settings, persisted as JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub model: String,
    pub endpoint: String,
    /// Read from the environment only, never persisted
    #[serde(skip)]
    pub api_key: Option<String>,
    pub capture_frame_samples: usize,
    pub outbound_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// None waits for the channel to open indefinitely
    pub open_timeout_ms: Option<u64>,
    pub instruction_template: String,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            endpoint: LIVE_ENDPOINT.to_string(),
            api_key: None,
            capture_frame_samples: CAPTURE_FRAME_SAMPLES,
            outbound_capacity: 32,
            overflow_policy: OverflowPolicy::DropOldest,
            open_timeout_ms: None,
            instruction_template: DEFAULT_INSTRUCTION.to_string(),
            input_device: None,
            output_device: None,
        }
    }
}

/// Path to the config file
pub fn config_path() -> PathBuf {
    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("zenflow");
    fs::create_dir_all(&config_dir).ok();
    config_dir.join("voice.json")
}

impl VoiceConfig {
    /// Load from the default location, falling back to defaults
    pub fn load() -> Self {
        let path = config_path();
        let mut config = if path.exists() {
            Self::load_from(&path).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable config {}: {}", path.display(), e);
                Self::default()
            })
        } else {
            Self::default()
        };
        config.api_key = api_key_from_env();
        config
    }

    pub fn load_from(path: &Path) -> Result<Self, VoiceError> {
        let content = fs::read_to_string(path).map_err(|e| VoiceError::Config(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| VoiceError::Config(e.to_string()))
    }

    /// Save to the default location
    pub fn save(&self) -> Result<(), VoiceError> {
        self.save_to(&config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), VoiceError> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| VoiceError::Config(e.to_string()))?;
        fs::write(path, content).map_err(|e| VoiceError::Config(e.to_string()))?;
        Ok(())
    }

    /// System instruction for a given user
    pub fn system_instruction(&self, user: &UserContext) -> String {
        self.instruction_template
            .replace(USERNAME_PLACEHOLDER, &user.username)
    }

    pub fn capture_format(&self) -> CaptureFormat {
        CaptureFormat {
            sample_rate: CAPTURE_SAMPLE_RATE,
            channels: CHANNELS,
            frame_samples: self.capture_frame_samples.max(1),
        }
    }

    pub fn session_format(&self) -> SessionFormat {
        SessionFormat::default()
    }

    pub fn open_timeout(&self) -> Option<Duration> {
        self.open_timeout_ms.map(Duration::from_millis)
    }

    /// API key or a config error naming the variables to set
    pub fn require_api_key(&self) -> Result<&str, VoiceError> {
        self.api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                VoiceError::Config(format!("API key missing, set {}", API_KEY_VARS.join(" or ")))
            })
    }
}

fn api_key_from_env() -> Option<String> {
    API_KEY_VARS
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruction_names_user() {
        let config = VoiceConfig::default();
        assert_eq!(
            config.system_instruction(&UserContext::new("admin")),
            "You are a task management helper for admin. Speak the language the user speaks."
        );
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: VoiceConfig =
            serde_json::from_str(r#"{"model":"custom-model","overflow_policy":"drop_newest"}"#).unwrap();
        assert_eq!(config.model, "custom-model");
        assert_eq!(config.overflow_policy, OverflowPolicy::DropNewest);
        assert_eq!(config.capture_frame_samples, CAPTURE_FRAME_SAMPLES);
        assert_eq!(config.open_timeout(), None);
    }

    #[test]
    fn test_api_key_never_serialized() {
        let config = VoiceConfig {
            api_key: Some("secret".to_string()),
            ..VoiceConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }

    #[test]
    fn test_save_and_load_file() {
        let path = std::env::temp_dir().join(format!("zenflow-voice-{}.json", uuid::Uuid::new_v4()));
        let config = VoiceConfig {
            open_timeout_ms: Some(5000),
            outbound_capacity: 8,
            ..VoiceConfig::default()
        };

        config.save_to(&path).unwrap();
        let loaded = VoiceConfig::load_from(&path).unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(loaded, config);
        assert_eq!(loaded.open_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_missing_key_is_config_error() {
        let config = VoiceConfig::default();
        assert!(matches!(config.require_api_key(), Err(VoiceError::Config(_))));
    }
}
