//! Lightweight MFCC-based wake word spotting.
//!
//! Detects the configured wake word in the live frame stream by comparing
//! MFCC features of a sliding one-second window against stored reference
//! recordings of the word, aligned with DTW (Dynamic Time Warping).
//!
//! No external ML dependencies; built on `rustfft`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use tracing::{info, warn};

use crate::audio::Frame;
use crate::error::{HarkError, Result};

/// Number of MFCC coefficients per analysis frame.
const NUM_MFCC: usize = 13;
/// Number of mel filter banks.
const NUM_MEL_FILTERS: usize = 26;
/// Analysis window length in milliseconds.
const ANALYSIS_WINDOW_MS: usize = 25;
/// Analysis hop in milliseconds.
const ANALYSIS_HOP_MS: usize = 10;
/// Detection score a window must reach, where score = 1 / (1 + distance).
const DEFAULT_THRESHOLD: f32 = 0.5;
/// Refractory period after a detection, in milliseconds of fed audio.
const COOLDOWN_MS: usize = 2000;

/// Outcome of feeding one frame through the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionResult {
    None,
    Wake,
}

/// Wake-word detection capability.
pub trait WakeDetector: Send {
    /// Feed one frame. Returns true when the wake word fired on the
    /// window ending at this frame.
    fn detect(&mut self, frame: &Frame) -> bool;

    /// Drop any buffered audio.
    fn reset(&mut self);

    /// Re-target a different wake word. Detectors without per-word state
    /// ignore this.
    fn rebind(&mut self, _wake_word: &str) {}
}

/// Keeps a detector bound to the currently configured wake word.
pub struct WakeGate<D: WakeDetector> {
    detector: D,
    bound_word: String,
}

impl<D: WakeDetector> WakeGate<D> {
    pub fn new(detector: D, wake_word: &str) -> Self {
        Self {
            detector,
            bound_word: wake_word.to_owned(),
        }
    }

    /// Rebind the detector if the configured word changed since the last
    /// frame.
    pub fn ensure_bound(&mut self, wake_word: &str) {
        if self.bound_word != wake_word {
            info!(from = %self.bound_word, to = %wake_word, "wake word changed, rebinding detector");
            self.detector.rebind(wake_word);
            self.bound_word = wake_word.to_owned();
        }
    }

    /// Feed one frame.
    pub fn feed(&mut self, frame: &Frame) -> DetectionResult {
        if self.detector.detect(frame) {
            DetectionResult::Wake
        } else {
            DetectionResult::None
        }
    }

    /// Drop buffered audio, e.g. after an utterance was captured.
    pub fn reset(&mut self) {
        self.detector.reset();
    }
}

/// One reference recording of the wake word, reduced to MFCC frames.
#[derive(Clone)]
struct Template {
    /// MFCC frames: `[num_frames][NUM_MFCC]`.
    features: Vec<Vec<f32>>,
}

/// Wake word spotter comparing live audio against reference recordings.
///
/// A spotter with no templates is disarmed: it consumes frames but never
/// fires. Templates live under `<root>/<wake_word>/*.wav` and are reloaded
/// on [`WakeDetector::rebind`].
pub struct TemplateSpotter {
    templates: Vec<Template>,
    extractor: MfccExtractor,
    threshold: f32,
    /// Rolling sample buffer; compared once it holds a full window, then
    /// slid forward by half a window.
    buffer: Vec<f32>,
    window_len: usize,
    cooldown_samples: usize,
    cooldown_remaining: usize,
    templates_root: PathBuf,
    sample_rate: u32,
}

impl TemplateSpotter {
    /// Create a spotter rooted at `templates_root`, loading references for
    /// `wake_word` from `<templates_root>/<wake_word>/`.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing template directory cannot be read.
    /// A missing directory is not an error; it produces a disarmed spotter.
    pub fn new(
        templates_root: PathBuf,
        wake_word: &str,
        sample_rate: u32,
        threshold: f32,
    ) -> Result<Self> {
        let extractor = MfccExtractor::new(sample_rate);
        let templates = load_templates(&templates_root.join(wake_word), &extractor, sample_rate)?;
        log_template_state(wake_word, templates.len());

        // One second of audio per detection window; references are
        // typically 0.3-0.8s, so this gives enough context.
        let window_len = sample_rate as usize;

        Ok(Self {
            templates,
            extractor,
            threshold,
            buffer: Vec::with_capacity(window_len * 2),
            window_len,
            cooldown_samples: sample_rate as usize * COOLDOWN_MS / 1000,
            cooldown_remaining: 0,
            templates_root,
            sample_rate,
        })
    }

    /// Create a spotter for `wake_word` using the standard data directory
    /// and the default detection threshold.
    ///
    /// # Errors
    ///
    /// Same conditions as [`TemplateSpotter::new`].
    pub fn for_wake_word(wake_word: &str, sample_rate: u32) -> Result<Self> {
        Self::new(
            crate::paths::wakewords_dir(),
            wake_word,
            sample_rate,
            DEFAULT_THRESHOLD,
        )
    }

    /// Whether any templates are loaded.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        !self.templates.is_empty()
    }

    /// Number of loaded templates.
    #[must_use]
    pub fn template_count(&self) -> usize {
        self.templates.len()
    }

    fn score_window(&self) -> f32 {
        let window = &self.buffer[self.buffer.len() - self.window_len..];
        let features = self.extractor.features(window);
        if features.is_empty() {
            return 0.0;
        }

        let mut best = 0.0f32;
        for template in &self.templates {
            let dist = dtw_distance(&features, &template.features);
            let score = 1.0 / (1.0 + dist);
            if score > best {
                best = score;
            }
        }
        best
    }
}

impl WakeDetector for TemplateSpotter {
    fn detect(&mut self, frame: &Frame) -> bool {
        if self.cooldown_remaining > 0 {
            self.cooldown_remaining = self.cooldown_remaining.saturating_sub(frame.samples.len());
            return false;
        }
        if self.templates.is_empty() {
            return false;
        }

        self.buffer.extend_from_slice(&frame.samples);
        if self.buffer.len() < self.window_len {
            return false;
        }

        let score = self.score_window();

        // Slide forward by half a window so consecutive checks overlap.
        let drain = self.window_len / 2;
        if self.buffer.len() > drain {
            self.buffer.drain(..drain);
        }

        if score >= self.threshold {
            self.buffer.clear();
            self.cooldown_remaining = self.cooldown_samples;
            return true;
        }
        false
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }

    fn rebind(&mut self, wake_word: &str) {
        let dir = self.templates_root.join(wake_word);
        match load_templates(&dir, &self.extractor, self.sample_rate) {
            Ok(templates) => {
                log_template_state(wake_word, templates.len());
                self.templates = templates;
            }
            Err(e) => {
                warn!(wake_word = %wake_word, error = %e, "failed to load wake word templates, detection disarmed");
                self.templates = Vec::new();
            }
        }
        self.buffer.clear();
        self.cooldown_remaining = 0;
    }
}

fn log_template_state(wake_word: &str, count: usize) {
    if count == 0 {
        warn!(wake_word = %wake_word, "no wake word templates found, detection disarmed");
    } else {
        info!(wake_word = %wake_word, count, "wake word templates loaded");
    }
}

/// Load reference WAV files from a directory and extract their features.
fn load_templates(
    dir: &Path,
    extractor: &MfccExtractor,
    sample_rate: u32,
) -> Result<Vec<Template>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut templates = Vec::new();
    let entries = std::fs::read_dir(dir)
        .map_err(|e| HarkError::Config(format!("cannot read templates dir: {e}")))?;

    for entry in entries {
        let entry = entry.map_err(|e| HarkError::Config(format!("cannot read dir entry: {e}")))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("wav") {
            continue;
        }

        match load_wav_mono(&path, sample_rate) {
            Ok(samples) => {
                let features = extractor.features(&samples);
                if !features.is_empty() {
                    info!("loaded wake word template: {}", path.display());
                    templates.push(Template { features });
                }
            }
            Err(e) => {
                info!("skipping invalid template {}: {e}", path.display());
            }
        }
    }

    Ok(templates)
}

/// Load a WAV file as mono f32 samples at the expected rate.
fn load_wav_mono(path: &Path, expected_rate: u32) -> Result<Vec<f32>> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| HarkError::Config(format!("cannot open WAV {}: {e}", path.display())))?;

    let spec = reader.spec();
    if spec.sample_rate != expected_rate {
        return Err(HarkError::Config(format!(
            "template WAV must be {}Hz, got {}Hz: {}",
            expected_rate,
            spec.sample_rate,
            path.display()
        )));
    }

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let max = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| {
                    s.map_err(|e| HarkError::Config(format!("WAV read error: {e}")))
                        .map(|v| v as f32 / max)
                })
                .collect::<Result<Vec<f32>>>()?
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map_err(|e| HarkError::Config(format!("WAV read error: {e}"))))
            .collect::<Result<Vec<f32>>>()?,
    };

    // Mix to mono if stereo.
    if spec.channels > 1 {
        let ch = spec.channels as usize;
        let mono: Vec<f32> = samples
            .chunks(ch)
            .map(|frame| frame.iter().sum::<f32>() / ch as f32)
            .collect();
        Ok(mono)
    } else {
        Ok(samples)
    }
}

/// Save samples as a 16-bit mono WAV template file.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn save_template_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .map_err(|e| HarkError::Config(format!("cannot create WAV: {e}")))?;

    for &s in samples {
        let sample_i16 = (s * 32767.0).clamp(-32768.0, 32767.0) as i16;
        writer
            .write_sample(sample_i16)
            .map_err(|e| HarkError::Config(format!("WAV write error: {e}")))?;
    }
    writer
        .finalize()
        .map_err(|e| HarkError::Config(format!("WAV finalize error: {e}")))?;

    Ok(())
}

// ── MFCC extraction ─────────────────────────────────────────────────

/// MFCC extraction pipeline with the FFT plan, Hann window, and mel
/// filterbank precomputed for one sample rate.
struct MfccExtractor {
    fft: Arc<dyn Fft<f32>>,
    hann: Vec<f32>,
    filterbank: Vec<Vec<f32>>,
    frame_len: usize,
    hop_len: usize,
}

impl MfccExtractor {
    fn new(sample_rate: u32) -> Self {
        let frame_len = sample_rate as usize * ANALYSIS_WINDOW_MS / 1000;
        let hop_len = sample_rate as usize * ANALYSIS_HOP_MS / 1000;

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(frame_len);

        let hann = (0..frame_len)
            .map(|n| {
                0.5 * (1.0
                    - (2.0 * std::f32::consts::PI * n as f32 / (frame_len - 1) as f32).cos())
            })
            .collect();

        let filterbank = build_mel_filterbank(NUM_MEL_FILTERS, frame_len, sample_rate);

        Self {
            fft,
            hann,
            filterbank,
            frame_len,
            hop_len,
        }
    }

    /// MFCC frames for a sample span, one vector per hop.
    fn features(&self, samples: &[f32]) -> Vec<Vec<f32>> {
        if samples.len() < self.frame_len {
            return Vec::new();
        }

        let num_frames = (samples.len() - self.frame_len) / self.hop_len + 1;
        let mut frames = Vec::with_capacity(num_frames);
        let mut scratch: Vec<Complex<f32>> = vec![Complex::new(0.0, 0.0); self.frame_len];

        for i in 0..num_frames {
            let start = i * self.hop_len;
            let end = start + self.frame_len;
            if end > samples.len() {
                break;
            }

            for (slot, (&s, &w)) in scratch
                .iter_mut()
                .zip(samples[start..end].iter().zip(self.hann.iter()))
            {
                *slot = Complex::new(s * w, 0.0);
            }
            self.fft.process(&mut scratch);

            // Power spectrum: first half plus DC.
            let power_len = self.frame_len / 2 + 1;
            let power: Vec<f32> = scratch[..power_len]
                .iter()
                .map(|c| (c.re * c.re + c.im * c.im) / self.frame_len as f32)
                .collect();

            let mel_energies: Vec<f32> = self
                .filterbank
                .iter()
                .map(|filter| {
                    let energy: f32 = filter.iter().zip(power.iter()).map(|(&f, &p)| f * p).sum();
                    // Floor avoids log(0).
                    energy.max(1e-10).ln()
                })
                .collect();

            frames.push(dct_ii(&mel_energies, NUM_MFCC));
        }

        frames
    }
}

/// Build mel-spaced triangular filterbank.
fn build_mel_filterbank(num_filters: usize, fft_size: usize, sample_rate: u32) -> Vec<Vec<f32>> {
    let power_len = fft_size / 2 + 1;
    let low_freq_mel = hz_to_mel(0.0);
    let high_freq_mel = hz_to_mel(sample_rate as f32 / 2.0);

    // Equally spaced mel points.
    let num_points = num_filters + 2;
    let mel_points: Vec<f32> = (0..num_points)
        .map(|i| low_freq_mel + (high_freq_mel - low_freq_mel) * i as f32 / (num_points - 1) as f32)
        .collect();

    let hz_points: Vec<f32> = mel_points.iter().map(|&m| mel_to_hz(m)).collect();

    // Convert Hz to FFT bin indices.
    let bin_points: Vec<usize> = hz_points
        .iter()
        .map(|&hz| ((fft_size as f32 + 1.0) * hz / sample_rate as f32).floor() as usize)
        .collect();

    let mut filterbank = Vec::with_capacity(num_filters);
    for m in 0..num_filters {
        let mut filter = vec![0.0f32; power_len];
        let left = bin_points[m];
        let center = bin_points[m + 1];
        let right = bin_points[m + 2];

        // Rising slope.
        if center > left {
            let denom = (center - left) as f32;
            for (i, val) in filter.iter_mut().enumerate().take(center).skip(left) {
                if i < power_len {
                    *val = (i - left) as f32 / denom;
                }
            }
        }
        // Falling slope.
        if right > center {
            let denom = (right - center) as f32;
            for (i, val) in filter.iter_mut().enumerate().take(right + 1).skip(center) {
                if i < power_len {
                    *val = (right - i) as f32 / denom;
                }
            }
        }

        filterbank.push(filter);
    }

    filterbank
}

/// DCT-II: extract `num_coeffs` coefficients from `input`.
fn dct_ii(input: &[f32], num_coeffs: usize) -> Vec<f32> {
    let n = input.len();
    let mut result = Vec::with_capacity(num_coeffs);
    for k in 0..num_coeffs {
        let mut sum = 0.0f32;
        for (i, &val) in input.iter().enumerate() {
            sum +=
                val * (std::f32::consts::PI * k as f32 * (2 * i + 1) as f32 / (2 * n) as f32).cos();
        }
        result.push(sum);
    }
    result
}

/// Convert frequency in Hz to mel scale.
fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

/// Convert mel scale to Hz.
fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10.0_f32.powf(mel / 2595.0) - 1.0)
}

// ── DTW (Dynamic Time Warping) ──────────────────────────────────────

/// DTW distance between two MFCC sequences, normalized by path length.
///
/// References are typically shorter than the one-second input window;
/// DTW absorbs the time alignment.
fn dtw_distance(input: &[Vec<f32>], reference: &[Vec<f32>]) -> f32 {
    let n = input.len();
    let m = reference.len();

    if n == 0 || m == 0 {
        return f32::INFINITY;
    }

    // Flat cost matrix for cache-friendliness.
    let mut cost = vec![f32::INFINITY; (n + 1) * (m + 1)];
    let idx = |i: usize, j: usize| i * (m + 1) + j;

    cost[idx(0, 0)] = 0.0;

    for i in 1..=n {
        for j in 1..=m {
            let d = frame_distance(&input[i - 1], &reference[j - 1]);
            let prev = cost[idx(i - 1, j)]
                .min(cost[idx(i, j - 1)])
                .min(cost[idx(i - 1, j - 1)]);
            cost[idx(i, j)] = d + prev;
        }
    }

    cost[idx(n, m)] / (n + m) as f32
}

/// Euclidean distance between two MFCC vectors.
fn frame_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}
