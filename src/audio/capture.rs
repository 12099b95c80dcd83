use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, Device, Host, SampleFormat, Stream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::device::{CaptureDevice, CaptureFormat};
use super::frames::FrameAssembler;
use super::AudioFrame;
use crate::error::VoiceError;

/// Microphone capture using cpal, cut into fixed-size frames at the capture rate
pub struct CpalCapture {
    stream: Option<Stream>,
    is_capturing: Arc<AtomicBool>,
    device_name: String,
}

impl CpalCapture {
    /// Open the input device at its native rate and build a (not yet forwarding) stream
    pub fn open(
        name: Option<&str>,
        format: CaptureFormat,
        frames: mpsc::Sender<AudioFrame>,
    ) -> Result<Self, VoiceError> {
        let host = cpal::default_host();
        let device = input_device_by_name(&host, name)?;
        let device_name = device.name().unwrap_or_default();

        // Use native sample rate, frames are resampled to the capture rate
        let supported_config = device
            .default_input_config()
            .map_err(|e| VoiceError::DeviceUnavailable(format!("Failed to get input config: {}", e)))?;
        let config = supported_config.config();

        tracing::info!(
            "Using input device: {} ({} Hz, {} ch)",
            device_name,
            config.sample_rate.0,
            config.channels
        );

        let is_capturing = Arc::new(AtomicBool::new(false));
        let mut assembler = FrameAssembler::new(format, config.sample_rate.0, config.channels, frames);

        let err_fn = |err| {
            tracing::error!("Audio input error: {}", err);
        };

        let stream = match supported_config.sample_format() {
            SampleFormat::F32 => {
                let gate = is_capturing.clone();
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if gate.load(Ordering::SeqCst) {
                            forward(&mut assembler, data);
                        }
                    },
                    err_fn,
                    None,
                )
            }
            SampleFormat::I16 => {
                let gate = is_capturing.clone();
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        if gate.load(Ordering::SeqCst) {
                            let float_data: Vec<f32> = data.iter().map(|&s| s as f32 / 32768.0).collect();
                            forward(&mut assembler, &float_data);
                        }
                    },
                    err_fn,
                    None,
                )
            }
            other => {
                return Err(VoiceError::DeviceUnavailable(format!(
                    "Unsupported sample format: {:?}",
                    other
                )));
            }
        }
        .map_err(map_build_error)?;

        // Some hosts start streams on creation
        if let Err(e) = stream.pause() {
            tracing::debug!("Input stream could not be paused: {}", e);
        }

        Ok(Self {
            stream: Some(stream),
            is_capturing,
            device_name,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// List available input devices
    pub fn list_devices() -> Result<Vec<String>, VoiceError> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| VoiceError::DeviceUnavailable(format!("Failed to enumerate input devices: {}", e)))?;

        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

impl CaptureDevice for CpalCapture {
    fn resume(&mut self) -> Result<(), VoiceError> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| VoiceError::DeviceUnavailable("Capture already released".to_string()))?;

        self.is_capturing.store(true, Ordering::SeqCst);
        stream
            .play()
            .map_err(|e| VoiceError::PermissionDenied(format!("Failed to start stream: {}", e)))?;

        tracing::info!("Audio capture started on: {}", self.device_name);
        Ok(())
    }

    fn release(&mut self) {
        self.is_capturing.store(false, Ordering::SeqCst);
        if self.stream.take().is_some() {
            tracing::info!("Audio capture stopped");
        }
    }
}

// Safety: the stream is only touched from the owning session task
unsafe impl Send for CpalCapture {}

/// Get an input device by name, or the default if None
fn input_device_by_name(host: &Host, name: Option<&str>) -> Result<Device, VoiceError> {
    match name {
        Some(device_name) => {
            let devices = host
                .input_devices()
                .map_err(|e| VoiceError::DeviceUnavailable(format!("Failed to enumerate devices: {}", e)))?;

            devices
                .into_iter()
                .find(|d| d.name().map(|n| n == device_name).unwrap_or(false))
                .ok_or_else(|| VoiceError::DeviceUnavailable(format!("Device '{}' not found", device_name)))
        }
        None => host
            .default_input_device()
            .ok_or_else(|| VoiceError::DeviceUnavailable("No input device available".to_string())),
    }
}

fn forward(assembler: &mut FrameAssembler, data: &[f32]) {
    if assembler.push(data) > 0 {
        tracing::debug!("Session behind, {} capture frames dropped so far", assembler.dropped());
    }
}

fn map_build_error(err: BuildStreamError) -> VoiceError {
    match err {
        BuildStreamError::DeviceNotAvailable
        | BuildStreamError::StreamConfigNotSupported
        | BuildStreamError::InvalidArgument => {
            VoiceError::DeviceUnavailable(format!("Failed to build input stream: {}", err))
        }
        // Hosts report refused microphone access as a backend error
        other => VoiceError::PermissionDenied(format!("Failed to build input stream: {}", other)),
    }
}
