pub mod audio;
mod cli;
pub mod config;
mod error;
pub mod live;
pub mod voice;

pub use cli::Cli;
#[cfg(feature = "device")]
pub use cli::run;
pub use config::VoiceConfig;
pub use error::VoiceError;
pub use live::{GeminiLiveConnector, LiveConnector, LiveLink};
pub use voice::{SessionState, SessionSummary, UserContext, VoiceSessionController};
