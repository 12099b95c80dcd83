mod codec;
mod device;
mod frames;
mod mixer;
mod pcm;
mod resample;
mod scheduler;

#[cfg(feature = "device")]
mod capture;
#[cfg(feature = "device")]
mod playback;

pub use codec::{decode, encode};
pub use device::{AudioDevices, CaptureDevice, CaptureFormat, PlaybackOutput};
pub use frames::{EndedNotifier, FrameAssembler};
pub use mixer::ScheduleMixer;
pub use pcm::{decode_pcm16, encode_pcm16};
pub use resample::resample;
pub use scheduler::{PlaybackScheduler, ScheduledSource, SourceId};

#[cfg(feature = "device")]
pub use capture::CpalCapture;
#[cfg(feature = "device")]
pub use device::CpalDevices;
#[cfg(feature = "device")]
pub use playback::CpalPlayback;

/// Microphone sample rate sent to the live service
pub const CAPTURE_SAMPLE_RATE: u32 = 16000;
/// Sample rate of the synthesized speech returned by the live service
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;
/// Channels (mono for voice)
pub const CHANNELS: u16 = 1;
/// Samples per capture frame (256ms at 16kHz)
pub const CAPTURE_FRAME_SAMPLES: usize = 4096;
/// Captured frames allowed to wait for the session task (about 2s)
pub const CAPTURE_BACKLOG_FRAMES: usize = 8;
/// Playback completions allowed to wait for the session task
pub const ENDED_BACKLOG: usize = 64;

/// MIME type tagging outbound PCM at the given rate
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// One block of captured microphone samples
#[derive(Clone, Debug, PartialEq)]
pub struct AudioFrame {
    /// Mono samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }
}

/// Decoded audio ready for the output device, one sample array per channel
#[derive(Clone, Debug, PartialEq)]
pub struct PlaybackBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl PlaybackBuffer {
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Self {
        Self { sample_rate, channels }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Samples for one channel
    pub fn channel(&self, index: usize) -> &[f32] {
        self.channels.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Frames per channel
    pub fn frame_count(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count() as f64 / self.sample_rate as f64
    }

    /// Average all channels into a single mono track
    pub fn mixdown(&self) -> Vec<f32> {
        match self.channels.len() {
            0 => Vec::new(),
            1 => self.channels[0].clone(),
            n => (0..self.frame_count())
                .map(|i| self.channels.iter().map(|c| c.get(i).copied().unwrap_or(0.0)).sum::<f32>() / n as f32)
                .collect(),
        }
    }
}
