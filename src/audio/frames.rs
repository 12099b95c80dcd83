//! Hand-off between device callbacks and the session task.
//! Both directions use bounded channels and never block the audio thread.

use std::collections::VecDeque;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::device::CaptureFormat;
use super::resample::resample;
use super::scheduler::SourceId;
use super::AudioFrame;

/// Cuts interleaved device input into mono frames at the capture rate.
/// A frame is discarded when the session has not taken the previous ones yet.
pub struct FrameAssembler {
    channels: usize,
    device_rate: u32,
    target_rate: u32,
    /// Device samples (per channel) that make up one outgoing frame
    device_frame: usize,
    pending: VecDeque<f32>,
    frames: mpsc::Sender<AudioFrame>,
    dropped: u64,
}

impl FrameAssembler {
    pub fn new(
        format: CaptureFormat,
        device_rate: u32,
        device_channels: u16,
        frames: mpsc::Sender<AudioFrame>,
    ) -> Self {
        let frame_samples = format.frame_samples.max(1);
        let device_frame = if device_rate == format.sample_rate || format.sample_rate == 0 {
            frame_samples
        } else {
            ((frame_samples as u64 * device_rate as u64) / format.sample_rate as u64).max(1) as usize
        };

        Self {
            channels: device_channels.max(1) as usize,
            device_rate,
            target_rate: format.sample_rate,
            device_frame,
            pending: VecDeque::with_capacity(device_frame * 2),
            frames,
            dropped: 0,
        }
    }

    /// Feed one callback worth of interleaved samples.
    /// Returns how many complete frames had to be discarded.
    pub fn push(&mut self, data: &[f32]) -> usize {
        // Convert to mono if needed by averaging channels
        if self.channels > 1 {
            for chunk in data.chunks(self.channels) {
                self.pending.push_back(chunk.iter().sum::<f32>() / self.channels as f32);
            }
        } else {
            self.pending.extend(data.iter().copied());
        }

        let mut discarded = 0;
        while self.pending.len() >= self.device_frame {
            let native: Vec<f32> = self.pending.drain(..self.device_frame).collect();
            let samples = resample(&native, self.device_rate, self.target_rate);

            match self.frames.try_send(AudioFrame::new(samples, self.target_rate)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.dropped += 1;
                    discarded += 1;
                }
                // Receiver gone means the session is over
                Err(TrySendError::Closed(_)) => {}
            }
        }
        discarded
    }

    /// Frames lost because the session fell behind
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Reports finished playback buffers to the session.
/// Ids that do not fit in the channel are kept and retried on the next call,
/// so every completion is eventually delivered.
pub struct EndedNotifier {
    ended: mpsc::Sender<SourceId>,
    backlog: VecDeque<SourceId>,
}

impl EndedNotifier {
    pub fn new(ended: mpsc::Sender<SourceId>) -> Self {
        Self {
            ended,
            backlog: VecDeque::new(),
        }
    }

    pub fn notify(&mut self, finished: impl IntoIterator<Item = SourceId>) {
        self.backlog.extend(finished);

        while let Some(&id) = self.backlog.front() {
            match self.ended.try_send(id) {
                Ok(()) => {
                    self.backlog.pop_front();
                }
                Err(TrySendError::Full(_)) => break,
                Err(TrySendError::Closed(_)) => {
                    self.backlog.clear();
                    break;
                }
            }
        }
    }

    /// Completions waiting for room in the channel
    pub fn backlog(&self) -> usize {
        self.backlog.len()
    }
}
