use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host, Stream};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::device::PlaybackOutput;
use super::frames::EndedNotifier;
use super::mixer::ScheduleMixer;
use super::scheduler::SourceId;
use super::PlaybackBuffer;
use crate::error::VoiceError;

/// Audio playback to speakers using cpal.
/// The output clock advances with every block the device pulls.
pub struct CpalPlayback {
    stream: Option<Stream>,
    mixer: Arc<Mutex<ScheduleMixer>>,
}

impl CpalPlayback {
    /// Open the output device at its native rate. Buffers at `sample_rate`
    /// are resampled when the device runs at another rate.
    pub fn open(
        name: Option<&str>,
        sample_rate: u32,
        ended: mpsc::Sender<SourceId>,
    ) -> Result<Self, VoiceError> {
        let host = cpal::default_host();
        let device = output_device_by_name(&host, name)?;

        let config = device
            .default_output_config()
            .map_err(|e| VoiceError::DeviceUnavailable(format!("Failed to get output config: {}", e)))?
            .config();
        let device_rate = config.sample_rate.0;
        let channels = config.channels.max(1) as usize;

        tracing::info!(
            "Using output device: {} ({} Hz, {} ch)",
            device.name().unwrap_or_default(),
            device_rate,
            channels
        );
        if device_rate != sample_rate {
            tracing::debug!("Resampling playback from {} Hz to {} Hz", sample_rate, device_rate);
        }

        let mixer = Arc::new(Mutex::new(ScheduleMixer::new(device_rate)));
        let render_mixer = mixer.clone();
        let mut notifier = EndedNotifier::new(ended);
        let mut mono: Vec<f32> = Vec::new();

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    mono.resize(data.len() / channels, 0.0);
                    let finished = render_mixer.lock().render(&mut mono);

                    // Same mono signal on every device channel
                    for (frame, &sample) in data.chunks_mut(channels).zip(mono.iter()) {
                        frame.fill(sample);
                    }
                    notifier.notify(finished);
                },
                |err| {
                    tracing::error!("Audio output error: {}", err);
                },
                None,
            )
            .map_err(|e| VoiceError::DeviceUnavailable(format!("Failed to build output stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| VoiceError::DeviceUnavailable(format!("Failed to start playback: {}", e)))?;

        tracing::info!("Audio playback started at {} Hz", device_rate);

        Ok(Self {
            stream: Some(stream),
            mixer,
        })
    }

    /// List available output devices
    pub fn list_devices() -> Result<Vec<String>, VoiceError> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| VoiceError::DeviceUnavailable(format!("Failed to enumerate output devices: {}", e)))?;

        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

impl PlaybackOutput for CpalPlayback {
    fn current_time(&self) -> f64 {
        self.mixer.lock().current_time()
    }

    fn schedule(&mut self, id: SourceId, buffer: PlaybackBuffer, start_at: f64) {
        self.mixer.lock().schedule(id, &buffer, start_at);
    }

    fn cancel(&mut self, id: SourceId) {
        self.mixer.lock().cancel(id);
    }

    fn close(&mut self) {
        self.mixer.lock().clear();
        if self.stream.take().is_some() {
            tracing::info!("Audio playback stopped");
        }
    }
}

// Safety: the stream is only touched from the owning session task
unsafe impl Send for CpalPlayback {}

/// Get an output device by name, or the default if None
fn output_device_by_name(host: &Host, name: Option<&str>) -> Result<Device, VoiceError> {
    match name {
        Some(device_name) => {
            let devices = host
                .output_devices()
                .map_err(|e| VoiceError::DeviceUnavailable(format!("Failed to enumerate devices: {}", e)))?;

            devices
                .into_iter()
                .find(|d| d.name().map(|n| n == device_name).unwrap_or(false))
                .ok_or_else(|| VoiceError::DeviceUnavailable(format!("Device '{}' not found", device_name)))
        }
        None => host
            .default_output_device()
            .ok_or_else(|| VoiceError::DeviceUnavailable("No output device available".to_string())),
    }
}
