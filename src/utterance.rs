//! Utterance capture: accumulates frames after a wake detection until
//! trailing silence or the hard duration cap ends the span.

use std::time::{Duration, Instant};

use crate::audio::{FRAME_MS, Frame};
use crate::config::RuntimeConfig;

/// Why a capture ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The trailing-silence window elapsed.
    SilenceTimeout,
    /// The hard length cap was reached.
    MaxDuration,
}

/// One bounded span of captured audio.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Mono samples in `[-1, 1]`, including the trailing silence.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// When capture started.
    pub started_at: Instant,
    /// Why capture ended.
    pub end_reason: EndReason,
}

impl Utterance {
    /// Audio length derived from the sample count.
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }
}

/// Capture progress after feeding one frame.
#[derive(Debug)]
pub enum CaptureStatus {
    Continue,
    Done(Utterance),
}

/// Frame accumulator driven while the pipeline is capturing.
///
/// Created fresh at each wake detection so the limits reflect the config
/// at that moment. Leading silence counts toward the trailing-silence
/// window, so a wake with no speech at all still ends promptly.
pub struct UtteranceCapturer {
    samples: Vec<f32>,
    sample_rate: u32,
    started_at: Instant,
    heard_speech: bool,
    silence_run: u32,
    silence_limit: u32,
    max_samples: usize,
}

impl UtteranceCapturer {
    /// Start a capture with limits derived from the current config.
    #[must_use]
    pub fn begin(config: &RuntimeConfig, sample_rate: u32) -> Self {
        let silence_limit = (config.silence_timeout_ms / u64::from(FRAME_MS)).max(1) as u32;
        let max_samples = config.max_utterance_secs as usize * sample_rate as usize;
        Self {
            samples: Vec::new(),
            sample_rate,
            started_at: Instant::now(),
            heard_speech: false,
            silence_run: 0,
            silence_limit,
            max_samples,
        }
    }

    /// Feed one frame with its speech classification.
    ///
    /// Returns `Done` once, when a limit trips; the capturer is spent
    /// after that.
    pub fn feed(&mut self, frame: &Frame, is_speech: bool) -> CaptureStatus {
        self.samples.extend_from_slice(&frame.samples);
        if is_speech {
            self.heard_speech = true;
            self.silence_run = 0;
        } else {
            self.silence_run += 1;
        }

        if self.samples.len() >= self.max_samples {
            return CaptureStatus::Done(self.finish(EndReason::MaxDuration));
        }
        if self.silence_run >= self.silence_limit {
            return CaptureStatus::Done(self.finish(EndReason::SilenceTimeout));
        }
        CaptureStatus::Continue
    }

    /// Whether any frame so far classified as speech.
    #[must_use]
    pub fn heard_speech(&self) -> bool {
        self.heard_speech
    }

    fn finish(&mut self, end_reason: EndReason) -> Utterance {
        Utterance {
            samples: std::mem::take(&mut self.samples),
            sample_rate: self.sample_rate,
            started_at: self.started_at,
            end_reason,
        }
    }
}
