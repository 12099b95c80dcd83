use tokio::sync::mpsc;

use super::scheduler::SourceId;
use super::{AudioFrame, PlaybackBuffer};
use crate::error::VoiceError;

/// Requested microphone format
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_samples: usize,
}

/// A microphone subscription. Frames flow only between `resume` and `release`.
pub trait CaptureDevice: Send {
    /// Begin delivering frames
    fn resume(&mut self) -> Result<(), VoiceError>;
    /// Stop delivering frames and give the device back
    fn release(&mut self);
}

/// An output context with its own clock
pub trait PlaybackOutput: Send {
    /// Output clock in seconds
    fn current_time(&self) -> f64;
    /// Play `buffer` starting at `start_at` on the output clock.
    /// Completion is reported by sending `id` on the output's ended channel.
    fn schedule(&mut self, id: SourceId, buffer: PlaybackBuffer, start_at: f64);
    /// Silence a scheduled buffer
    fn cancel(&mut self, id: SourceId);
    /// Tear down the output
    fn close(&mut self);
}

/// Source of capture and playback endpoints for a session
pub trait AudioDevices: Send + Sync {
    /// Request microphone access. Frames are pushed to `frames` once resumed;
    /// a frame that finds the channel full is dropped.
    fn acquire_input(
        &self,
        format: CaptureFormat,
        frames: mpsc::Sender<AudioFrame>,
    ) -> Result<Box<dyn CaptureDevice>, VoiceError>;

    /// Open an output context for buffers at `sample_rate`.
    /// Every finished buffer id is eventually delivered on `ended`.
    fn open_output(
        &self,
        sample_rate: u32,
        ended: mpsc::Sender<SourceId>,
    ) -> Result<Box<dyn PlaybackOutput>, VoiceError>;
}

/// Default host microphone and speakers through cpal
#[cfg(feature = "device")]
#[derive(Debug, Default, Clone)]
pub struct CpalDevices {
    input_device: Option<String>,
    output_device: Option<String>,
}

#[cfg(feature = "device")]
impl CpalDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use named devices instead of the host defaults
    pub fn with_devices(input_device: Option<String>, output_device: Option<String>) -> Self {
        Self {
            input_device,
            output_device,
        }
    }
}

#[cfg(feature = "device")]
impl AudioDevices for CpalDevices {
    fn acquire_input(
        &self,
        format: CaptureFormat,
        frames: mpsc::Sender<AudioFrame>,
    ) -> Result<Box<dyn CaptureDevice>, VoiceError> {
        let capture = super::CpalCapture::open(self.input_device.as_deref(), format, frames)?;
        Ok(Box::new(capture))
    }

    fn open_output(
        &self,
        sample_rate: u32,
        ended: mpsc::Sender<SourceId>,
    ) -> Result<Box<dyn PlaybackOutput>, VoiceError> {
        let playback = super::CpalPlayback::open(self.output_device.as_deref(), sample_rate, ended)?;
        Ok(Box::new(playback))
    }
}
