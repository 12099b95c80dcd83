use super::resample::resample;
use super::scheduler::SourceId;
use super::PlaybackBuffer;

/// A buffer waiting for (or in the middle of) playback
struct ScheduledVoice {
    id: SourceId,
    /// Absolute output frame where the first sample plays
    start_frame: u64,
    samples: Vec<f32>,
}

impl ScheduledVoice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Renders scheduled buffers onto a mono output timeline.
/// The output clock is the number of frames rendered so far.
pub struct ScheduleMixer {
    sample_rate: u32,
    frames_rendered: u64,
    voices: Vec<ScheduledVoice>,
    /// Master volume (0.0 - 1.0)
    master_volume: f32,
}

impl ScheduleMixer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            frames_rendered: 0,
            voices: Vec::new(),
            master_volume: 1.0,
        }
    }

    /// Output clock in seconds
    pub fn current_time(&self) -> f64 {
        self.frames_rendered as f64 / self.sample_rate as f64
    }

    /// Queue a buffer to start at `start_at` seconds on the output clock.
    /// A start time already in the past plays immediately. Buffers at another
    /// rate are resampled to the output rate.
    pub fn schedule(&mut self, id: SourceId, buffer: &PlaybackBuffer, start_at: f64) {
        let start_frame = (start_at.max(0.0) * self.sample_rate as f64).round() as u64;
        self.voices.push(ScheduledVoice {
            id,
            start_frame: start_frame.max(self.frames_rendered),
            samples: resample(&buffer.mixdown(), buffer.sample_rate(), self.sample_rate),
        });
    }

    /// Drop a buffer without playing the rest of it
    pub fn cancel(&mut self, id: SourceId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.id != id);
        self.voices.len() != before
    }

    /// Drop everything still queued
    pub fn clear(&mut self) {
        self.voices.clear();
    }

    /// Number of buffers not yet finished
    pub fn pending(&self) -> usize {
        self.voices.len()
    }

    /// Set master volume (0.0 - 1.0)
    pub fn set_master_volume(&mut self, volume: f32) {
        self.master_volume = volume.clamp(0.0, 1.0);
    }

    /// Fill `output` with the next block of the timeline and advance the clock.
    /// Returns the ids of buffers that finished within this block.
    pub fn render(&mut self, output: &mut [f32]) -> Vec<SourceId> {
        output.fill(0.0);

        let block_start = self.frames_rendered;
        let block_end = block_start + output.len() as u64;

        for voice in &self.voices {
            if voice.start_frame >= block_end || voice.end_frame() <= block_start {
                continue;
            }

            let from = voice.start_frame.max(block_start);
            let to = voice.end_frame().min(block_end);
            for frame in from..to {
                let out_index = (frame - block_start) as usize;
                let sample_index = (frame - voice.start_frame) as usize;
                output[out_index] += voice.samples[sample_index];
            }
        }

        // Apply master volume and clamp
        for sample in output.iter_mut() {
            *sample = (*sample * self.master_volume).clamp(-1.0, 1.0);
        }

        self.frames_rendered = block_end;

        let mut ended = Vec::new();
        self.voices.retain(|voice| {
            if voice.end_frame() <= block_end {
                ended.push(voice.id);
                false
            } else {
                true
            }
        });
        ended
    }
}
