mod controller;
mod outbound;
mod session;

pub use controller::{SessionSummary, VoiceSessionController};
pub use outbound::{OutboundQueue, OverflowPolicy, PushOutcome};
pub use session::{Effect, Session, SessionEvent, SessionFormat};

use serde::{Deserialize, Serialize};

/// Lifecycle of a live voice conversation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closed,
}

impl SessionState {
    /// Connecting or Open
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }
}

/// The signed-in user a session talks to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    pub username: String,
}

impl UserContext {
    pub fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
        }
    }
}
