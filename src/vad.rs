//! Voice activity detection using RMS energy thresholding.

use crate::audio::Frame;

/// Per-frame speech/silence classification.
pub trait VoiceActivity: Send {
    /// Classify one frame as speech or silence.
    fn is_speech(&mut self, frame: &Frame) -> bool;

    /// Adjust sensitivity. Detectors without presets ignore this.
    fn set_aggressiveness(&mut self, _aggressiveness: u8) {}
}

/// RMS thresholds indexed by aggressiveness, for f32 samples in `[-1, 1]`.
const THRESHOLDS: [f32; 4] = [0.004, 0.008, 0.015, 0.03];

/// Energy-based voice activity detector.
///
/// Aggressiveness picks the RMS threshold a frame must clear to count as
/// speech:
///   - 0: very sensitive (picks up quiet speech and some noise)
///   - 1: normal sensitivity
///   - 2: reduced sensitivity (noisy environments)
///   - 3: strict (only loud/close speech)
pub struct EnergyVad {
    threshold: f32,
}

impl EnergyVad {
    /// Create a detector for the given aggressiveness (0-3). Values above
    /// 3 behave like 3.
    #[must_use]
    pub fn new(aggressiveness: u8) -> Self {
        Self {
            threshold: THRESHOLDS[usize::from(aggressiveness.min(3))],
        }
    }
}

impl VoiceActivity for EnergyVad {
    fn is_speech(&mut self, frame: &Frame) -> bool {
        rms_energy(&frame.samples) > self.threshold
    }

    fn set_aggressiveness(&mut self, aggressiveness: u8) {
        self.threshold = THRESHOLDS[usize::from(aggressiveness.min(3))];
    }
}

/// Root-mean-square energy of a sample buffer.
#[must_use]
pub fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
