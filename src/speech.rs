//! Speech output: rendering and playback serialized through a dedicated
//! worker thread so the pipeline never waits on audio.

use std::io::Cursor;
use std::process::Command;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::audio::CpalPlayback;
use crate::config::ConfigStore;
use crate::error::{HarkError, Result};

/// Rendered speech ready for playback.
#[derive(Debug, Clone)]
pub struct AudioClip {
    /// Mono samples in `[-1, 1]`.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

/// Text-to-speech capability.
pub trait SpeechSynthesizer: Send {
    /// Render text to PCM.
    ///
    /// # Errors
    ///
    /// Returns a playback error when the renderer fails.
    fn synthesize(&mut self, text: &str) -> Result<AudioClip>;
}

/// Playback sink capability; lets tests drive the worker without an
/// audio device.
pub trait PlaybackSink: Send {
    /// Play a clip to completion.
    ///
    /// # Errors
    ///
    /// Returns a playback error when the device fails.
    fn play(&mut self, clip: &AudioClip) -> Result<()>;
}

impl PlaybackSink for CpalPlayback {
    fn play(&mut self, clip: &AudioClip) -> Result<()> {
        CpalPlayback::play(self, &clip.samples, clip.sample_rate)
    }
}

/// Cloneable enqueue handle for the speech worker. Never blocks.
#[derive(Clone)]
pub struct SpeechQueue {
    tx: Sender<String>,
}

impl SpeechQueue {
    /// Create a queue plus the raw receiver that drains it.
    #[must_use]
    pub fn channel() -> (Self, Receiver<String>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }

    /// Queue text for speaking and return immediately.
    pub fn enqueue(&self, text: impl Into<String>) {
        if self.tx.send(text.into()).is_err() {
            warn!("speech worker gone, dropping reply");
        }
    }
}

/// Spawn the speech worker thread.
///
/// The worker renders and plays queued texts strictly in order, reading
/// the volume setting at playback time. Render and playback failures are
/// logged and the worker moves on to the next item. Dropping every
/// [`SpeechQueue`] clone lets the worker drain what remains and exit.
///
/// # Errors
///
/// Returns an error if the worker thread cannot be spawned.
pub fn spawn_speaker(
    mut synthesizer: Box<dyn SpeechSynthesizer>,
    mut sink: Box<dyn PlaybackSink>,
    config: ConfigStore,
) -> Result<(SpeechQueue, JoinHandle<()>)> {
    let (queue, rx) = SpeechQueue::channel();

    let handle = std::thread::Builder::new()
        .name("speech-worker".to_owned())
        .spawn(move || {
            for text in rx {
                let volume = config.get().volume;
                match synthesizer.synthesize(&text) {
                    Ok(clip) => {
                        let scaled = apply_volume(&clip, volume);
                        debug!(
                            chars = text.len(),
                            samples = scaled.samples.len(),
                            volume,
                            "speaking reply"
                        );
                        if let Err(e) = sink.play(&scaled) {
                            warn!(error = %e, "playback failed, continuing");
                        }
                    }
                    Err(e) => warn!(error = %e, "speech rendering failed, skipping reply"),
                }
            }
            info!("speech worker stopped");
        })
        .map_err(|e| HarkError::Playback(format!("failed to spawn speech worker: {e}")))?;

    Ok((queue, handle))
}

/// Scale a clip by a 0-100 volume setting.
#[must_use]
pub fn apply_volume(clip: &AudioClip, volume: u8) -> AudioClip {
    let gain = f32::from(volume.min(100)) / 100.0;
    AudioClip {
        samples: clip.samples.iter().map(|s| s * gain).collect(),
        sample_rate: clip.sample_rate,
    }
}

/// External renderer: runs a command with the text appended as the final
/// argument and decodes the WAV it writes to stdout.
pub struct CommandSynthesizer {
    program: String,
    args: Vec<String>,
}

impl CommandSynthesizer {
    /// Parse a renderer command line such as `espeak-ng --stdout`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for an empty command line.
    pub fn new(command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_owned);
        let program = parts
            .next()
            .ok_or_else(|| HarkError::InvalidConfig("tts_command must not be empty".to_owned()))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl SpeechSynthesizer for CommandSynthesizer {
    fn synthesize(&mut self, text: &str) -> Result<AudioClip> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(text)
            .output()
            .map_err(|e| HarkError::Playback(format!("cannot run {}: {e}", self.program)))?;

        if !output.status.success() {
            return Err(HarkError::Playback(format!(
                "{} exited with {}",
                self.program, output.status
            )));
        }

        decode_wav(&output.stdout)
    }
}

/// Decode a WAV byte buffer into mono f32 samples.
fn decode_wav(bytes: &[u8]) -> Result<AudioClip> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| HarkError::Playback(format!("renderer produced invalid WAV: {e}")))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let max = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| {
                    s.map(|v| v as f32 / max)
                        .map_err(|e| HarkError::Playback(format!("WAV read error: {e}")))
                })
                .collect::<Result<_>>()?
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map_err(|e| HarkError::Playback(format!("WAV read error: {e}"))))
            .collect::<Result<_>>()?,
    };

    let samples = if spec.channels > 1 {
        let ch = spec.channels as usize;
        samples
            .chunks(ch)
            .map(|f| f.iter().sum::<f32>() / ch as f32)
            .collect()
    } else {
        samples
    };

    Ok(AudioClip {
        samples,
        sample_rate: spec.sample_rate,
    })
}
