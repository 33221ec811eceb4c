//! Microphone capture using cpal.
//!
//! Captures at the device's native sample rate, downsamples to the
//! configured pipeline rate, and slices the result into fixed-duration
//! frames pulled by the pipeline thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info};

use crate::config::RuntimeConfig;
use crate::error::{HarkError, Result};

use super::{Frame, FrameSource, frame_samples};

/// Frames buffered between the capture callback and the pipeline.
const FRAME_CHANNEL_CAPACITY: usize = 64;

/// How long `next_frame` waits between device liveness checks.
const RECV_TICK: Duration = Duration::from_millis(250);

/// Pull handle over a live cpal input stream.
///
/// The stream itself stays on a dedicated holder thread (cpal streams
/// cannot move across threads); this handle is what the pipeline thread
/// owns. The capture callback never blocks: frames are dropped when the
/// consumer falls behind.
pub struct CpalFrameSource {
    rx: Receiver<Frame>,
    stop: Arc<AtomicBool>,
    device_lost: Arc<AtomicBool>,
}

impl CpalFrameSource {
    /// Open the configured input device and start capturing.
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if the device cannot be opened or the
    /// stream cannot start.
    pub fn open(config: &RuntimeConfig) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded(FRAME_CHANNEL_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        let device_lost = Arc::new(AtomicBool::new(false));

        let device_name = if config.input_device.is_empty() {
            None
        } else {
            Some(config.input_device.clone())
        };
        let target_rate = config.sample_rate;

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        {
            let stop = Arc::clone(&stop);
            let device_lost = Arc::clone(&device_lost);
            std::thread::Builder::new()
                .name("audio-capture".to_owned())
                .spawn(move || {
                    hold_stream(device_name, target_rate, tx, &ready_tx, &stop, &device_lost);
                })
                .map_err(|e| {
                    HarkError::DeviceUnavailable(format!("failed to spawn capture thread: {e}"))
                })?;
        }

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                rx,
                stop,
                device_lost,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(HarkError::DeviceUnavailable(
                "capture thread exited during startup".to_owned(),
            )),
        }
    }

    /// List available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| HarkError::DeviceUnavailable(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}

impl FrameSource for CpalFrameSource {
    fn next_frame(&mut self) -> Result<Frame> {
        loop {
            if self.device_lost.load(Ordering::Relaxed) {
                return Err(HarkError::DeviceLost(
                    "input stream reported an error".to_owned(),
                ));
            }
            match self.rx.recv_timeout(RECV_TICK) {
                Ok(frame) => return Ok(frame),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(HarkError::DeviceLost("capture thread stopped".to_owned()));
                }
            }
        }
    }
}

impl Drop for CpalFrameSource {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Build the stream, report readiness, then keep it alive until stopped.
fn hold_stream(
    device_name: Option<String>,
    target_rate: u32,
    tx: Sender<Frame>,
    ready_tx: &Sender<Result<()>>,
    stop: &AtomicBool,
    device_lost: &Arc<AtomicBool>,
) {
    match build_stream(device_name.as_deref(), target_rate, tx, device_lost) {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            while !stop.load(Ordering::Relaxed) && !device_lost.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(50));
            }
            drop(stream);
            info!("audio capture stopped");
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
        }
    }
}

fn build_stream(
    device_name: Option<&str>,
    target_rate: u32,
    tx: Sender<Frame>,
    device_lost: &Arc<AtomicBool>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = if let Some(name) = device_name {
        host.input_devices()
            .map_err(|e| HarkError::DeviceUnavailable(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| {
                HarkError::DeviceUnavailable(format!("input device '{name}' not found"))
            })?
    } else {
        host.default_input_device()
            .ok_or_else(|| HarkError::DeviceUnavailable("no default input device".to_owned()))?
    };

    let device_label = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".to_owned());
    info!("using input device: {device_label}");

    // Use the device's default config for best compatibility
    let default_config = device
        .default_input_config()
        .map_err(|e| HarkError::DeviceUnavailable(format!("no default input config: {e}")))?;

    let native_rate = default_config.sample_rate();
    let native_channels = default_config.channels();

    let stream_config = StreamConfig {
        channels: native_channels,
        sample_rate: native_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    info!(
        "native input config: {}Hz, {} channels",
        native_rate, native_channels
    );

    let mut assembler = FrameAssembler::new(target_rate);
    let error_flag = Arc::clone(device_lost);

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mono = if native_channels > 1 {
                    to_mono(data, native_channels)
                } else {
                    data.to_vec()
                };

                let samples = if native_rate == target_rate {
                    mono
                } else {
                    downsample(&mono, native_rate, target_rate)
                };

                for frame in assembler.push(&samples) {
                    // try_send keeps the audio thread from ever blocking
                    if tx.try_send(frame).is_err() {
                        debug!("frame channel full, dropping frame");
                    }
                }
            },
            move |err| {
                error!("audio input stream error: {err}");
                error_flag.store(true, Ordering::Relaxed);
            },
            None,
        )
        .map_err(|e| HarkError::DeviceUnavailable(format!("failed to build input stream: {e}")))?;

    stream
        .play()
        .map_err(|e| HarkError::DeviceUnavailable(format!("failed to start input stream: {e}")))?;

    info!("audio capture started: native {native_rate}Hz -> pipeline {target_rate}Hz");
    Ok(stream)
}

/// Accumulates resampled audio and emits exact fixed-duration frames.
struct FrameAssembler {
    pending: Vec<f32>,
    frame_len: usize,
    sample_rate: u32,
}

impl FrameAssembler {
    fn new(sample_rate: u32) -> Self {
        Self {
            pending: Vec::new(),
            frame_len: frame_samples(sample_rate),
            sample_rate,
        }
    }

    fn push(&mut self, samples: &[f32]) -> Vec<Frame> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_len {
            let rest = self.pending.split_off(self.frame_len);
            let samples = std::mem::replace(&mut self.pending, rest);
            frames.push(Frame {
                samples,
                sample_rate: self.sample_rate,
                captured_at: Instant::now(),
            });
        }
        frames
    }
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
#[must_use]
pub fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Simple linear-interpolation downsampler.
///
/// Sufficient for speech (energy below 8kHz), no anti-alias filter needed.
#[must_use]
pub fn downsample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            samples[idx] as f64 * (1.0 - frac) + samples[idx + 1] as f64 * frac
        } else {
            samples[idx.min(samples.len() - 1)] as f64
        };

        output.push(sample as f32);
    }

    output
}
