//! Audio playback to system speakers via cpal.

use std::sync::{Arc, Mutex};

use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{error, info};

use crate::error::{HarkError, Result};

/// Audio playback to system speakers via cpal.
///
/// Holds only the configured device name; the device and stream are
/// resolved per clip on the calling thread, so the speech worker can own
/// playback without moving cpal handles across threads.
pub struct CpalPlayback {
    output_device: Option<String>,
}

impl CpalPlayback {
    /// Create a playback handle. An empty name selects the system default
    /// device.
    #[must_use]
    pub fn new(output_device: &str) -> Self {
        Self {
            output_device: if output_device.is_empty() {
                None
            } else {
                Some(output_device.to_owned())
            },
        }
    }

    /// Play mono samples at the clip's rate, blocking until done.
    ///
    /// # Errors
    ///
    /// Returns a playback error if the device cannot be resolved or the
    /// stream cannot be created or started.
    pub fn play(&mut self, samples: &[f32], sample_rate: u32) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let device = self.resolve_device()?;
        let stream_config = StreamConfig {
            channels: 1,
            sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let buffer = Arc::new(Mutex::new(PlaybackBuffer {
            samples: samples.to_vec(),
            position: 0,
            finished: false,
        }));

        let buffer_clone = Arc::clone(&buffer);

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    let mut buf = match buffer_clone.lock() {
                        Ok(b) => b,
                        Err(_) => return,
                    };

                    for sample in data.iter_mut() {
                        if buf.position < buf.samples.len() {
                            *sample = buf.samples[buf.position];
                            buf.position += 1;
                        } else {
                            *sample = 0.0;
                            buf.finished = true;
                        }
                    }
                },
                move |err| {
                    error!("audio output stream error: {err}");
                },
                None,
            )
            .map_err(|e| HarkError::Playback(format!("failed to build output stream: {e}")))?;

        stream
            .play()
            .map_err(|e| HarkError::Playback(format!("failed to start output stream: {e}")))?;

        // Wait for playback to finish
        loop {
            std::thread::sleep(std::time::Duration::from_millis(10));
            let buf = buffer
                .lock()
                .map_err(|e| HarkError::Playback(format!("playback buffer lock poisoned: {e}")))?;
            if buf.finished {
                break;
            }
        }

        drop(stream);
        Ok(())
    }

    fn resolve_device(&self) -> Result<cpal::Device> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = self.output_device {
            host.output_devices()
                .map_err(|e| HarkError::Playback(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| HarkError::Playback(format!("output device '{name}' not found")))?
        } else {
            host.default_output_device()
                .ok_or_else(|| HarkError::Playback("no default output device".to_owned()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".to_owned());
        info!("using output device: {device_name}");

        Ok(device)
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| HarkError::Playback(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}

/// Internal buffer for tracking playback progress.
struct PlaybackBuffer {
    samples: Vec<f32>,
    position: usize,
    finished: bool,
}
