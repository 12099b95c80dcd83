//! Voice session state machine.
//!
//! Every callback of a live conversation (channel open, captured frame, inbound
//! message, playback completion, close, stop) is an event fed to [`Session::handle`],
//! which updates the session and returns the side effects the runtime must perform.
//! No audio device or network is touched here.

use crate::audio::{
    self, decode_pcm16, encode_pcm16, AudioFrame, PlaybackBuffer, PlaybackScheduler,
    ScheduledSource, SourceId,
};
use crate::error::VoiceError;
use crate::live::{Blob, RealtimeInput, ServerMessage};

use super::SessionState;

/// Something that happened to the session
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    ChannelOpened,
    CaptureFrame(AudioFrame),
    Inbound(ServerMessage),
    SourceEnded(SourceId),
    ChannelClosed { reason: Option<String> },
    ChannelFailed(String),
    /// Capture or playback device stopped working
    DeviceFailed(String),
    OpenTimedOut,
    Stop,
}

/// Work the runtime performs on behalf of the session
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    StartCapture,
    Transmit(RealtimeInput),
    Schedule {
        source: ScheduledSource,
        buffer: PlaybackBuffer,
    },
    Cancel(Vec<SourceId>),
    ReleaseCapture,
    CloseChannel,
}

/// Fixed audio parameters of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionFormat {
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
    pub playback_channels: u16,
}

impl Default for SessionFormat {
    fn default() -> Self {
        Self {
            capture_sample_rate: audio::CAPTURE_SAMPLE_RATE,
            playback_sample_rate: audio::PLAYBACK_SAMPLE_RATE,
            playback_channels: audio::CHANNELS,
        }
    }
}

/// State of one live conversation, from Connecting to Closed
#[derive(Debug)]
pub struct Session {
    state: SessionState,
    format: SessionFormat,
    mime_type: String,
    scheduler: PlaybackScheduler,
    frames_sent: u64,
    chunks_received: u64,
    last_error: Option<String>,
}

impl Session {
    /// A session that has begun connecting
    pub fn connecting(format: SessionFormat) -> Self {
        Self {
            state: SessionState::Connecting,
            format,
            mime_type: audio::pcm_mime_type(format.capture_sample_rate),
            scheduler: PlaybackScheduler::new(),
            frames_sent: 0,
            chunks_received: 0,
            last_error: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn scheduler(&self) -> &PlaybackScheduler {
        &self.scheduler
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn chunks_received(&self) -> u64 {
        self.chunks_received
    }

    /// Why the session ended, when it ended on a failure
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Closed with nothing left sounding
    pub fn is_finished(&self) -> bool {
        self.state == SessionState::Closed && self.scheduler.active_count() == 0
    }

    /// Apply one event. `now` is the output clock in seconds.
    pub fn handle(&mut self, event: SessionEvent, now: f64) -> Vec<Effect> {
        match (self.state, event) {
            (SessionState::Connecting, SessionEvent::ChannelOpened) => {
                tracing::info!("Live channel open");
                self.state = SessionState::Open;
                vec![Effect::StartCapture]
            }

            (SessionState::Open, SessionEvent::CaptureFrame(frame)) => {
                self.frames_sent += 1;
                vec![Effect::Transmit(self.encode_frame(&frame))]
            }

            (SessionState::Open, SessionEvent::Inbound(msg)) => self.receive(&msg, now),

            (_, SessionEvent::SourceEnded(id)) => {
                self.scheduler.finish(id);
                Vec::new()
            }

            (SessionState::Connecting | SessionState::Open, SessionEvent::ChannelClosed { reason }) => {
                tracing::info!(
                    "Live channel closed: {}",
                    reason.as_deref().unwrap_or("no reason")
                );
                self.state = SessionState::Closed;
                vec![Effect::ReleaseCapture, Effect::CloseChannel]
            }

            (SessionState::Connecting | SessionState::Open, SessionEvent::ChannelFailed(reason)) => {
                tracing::error!("Live channel failed: {}", reason);
                self.fail(reason)
            }

            (SessionState::Connecting | SessionState::Open, SessionEvent::DeviceFailed(reason)) => {
                tracing::error!("Audio device failed: {}", reason);
                let cancelled = self.scheduler.drain();
                let mut effects = self.fail(reason);
                if !cancelled.is_empty() {
                    effects.insert(0, Effect::Cancel(cancelled));
                }
                effects
            }

            (SessionState::Connecting, SessionEvent::OpenTimedOut) => {
                tracing::error!("Live channel did not open in time");
                self.fail("timed out waiting for the channel to open".to_string())
            }

            (state, SessionEvent::Stop) => {
                let cancelled = self.scheduler.drain();
                self.state = SessionState::Closed;

                let mut effects = Vec::new();
                if !cancelled.is_empty() {
                    effects.push(Effect::Cancel(cancelled));
                }
                if state != SessionState::Closed {
                    tracing::info!("Voice session stopped");
                    effects.push(Effect::ReleaseCapture);
                    effects.push(Effect::CloseChannel);
                }
                effects
            }

            (state, event) => {
                tracing::debug!("Ignoring {} while {:?}", event_name(&event), state);
                Vec::new()
            }
        }
    }

    fn fail(&mut self, reason: String) -> Vec<Effect> {
        self.last_error = Some(reason);
        self.state = SessionState::Closed;
        vec![Effect::ReleaseCapture, Effect::CloseChannel]
    }

    fn encode_frame(&self, frame: &AudioFrame) -> RealtimeInput {
        let mime_type = if frame.sample_rate == self.format.capture_sample_rate {
            self.mime_type.clone()
        } else {
            audio::pcm_mime_type(frame.sample_rate)
        };

        RealtimeInput {
            media: Blob {
                mime_type,
                data: audio::encode(&encode_pcm16(&frame.samples)),
            },
        }
    }

    fn receive(&mut self, msg: &ServerMessage, now: f64) -> Vec<Effect> {
        if msg.is_interrupted() {
            tracing::debug!("Model turn interrupted");
        }
        if msg.is_turn_complete() {
            tracing::debug!("Model turn complete");
        }

        let Some(payload) = msg.audio_data() else {
            return Vec::new();
        };

        match self.schedule_payload(payload, now) {
            Ok(effect) => vec![effect],
            Err(e) => {
                tracing::warn!("Dropping inbound audio chunk: {}", e);
                Vec::new()
            }
        }
    }

    /// Decode a base64 PCM payload and place it on the playback timeline.
    /// On error the clock and active sources are left untouched.
    pub fn schedule_payload(&mut self, payload: &str, now: f64) -> Result<Effect, VoiceError> {
        let bytes = audio::decode(payload)?;
        let buffer = decode_pcm16(
            &bytes,
            self.format.playback_sample_rate,
            self.format.playback_channels,
        );

        let source = self.scheduler.schedule(buffer.duration(), now);
        self.chunks_received += 1;
        Ok(Effect::Schedule { source, buffer })
    }
}

fn event_name(event: &SessionEvent) -> &'static str {
    match event {
        SessionEvent::ChannelOpened => "ChannelOpened",
        SessionEvent::CaptureFrame(_) => "CaptureFrame",
        SessionEvent::Inbound(_) => "Inbound",
        SessionEvent::SourceEnded(_) => "SourceEnded",
        SessionEvent::ChannelClosed { .. } => "ChannelClosed",
        SessionEvent::ChannelFailed(_) => "ChannelFailed",
        SessionEvent::DeviceFailed(_) => "DeviceFailed",
        SessionEvent::OpenTimedOut => "OpenTimedOut",
        SessionEvent::Stop => "Stop",
    }
}
