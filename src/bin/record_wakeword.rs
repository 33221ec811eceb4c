//! Interactive recorder for wake word reference templates.
//!
//! Records a handful of short clips from the input device, trims the
//! surrounding silence, and saves them where the daemon looks for
//! templates. The daemon stays disarmed until at least one template
//! exists, so this is the first thing to run on a new install.
//!
//! Usage: `hark-record [wake-word]`. Without an argument the wake word
//! comes from the daemon config.

use std::io::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use hark::audio::{downsample, to_mono};
use hark::config::RuntimeConfig;
use hark::vad::rms_energy;
use hark::{paths, wakeword};

/// Number of reference clips to record.
const TEMPLATE_COUNT: usize = 5;
/// Length of each recording window in seconds.
const RECORD_SECS: f32 = 2.0;
/// RMS below this counts as silence when trimming a take.
const SILENCE_RMS: f32 = 0.005;

fn main() -> Result<()> {
    let config = load_config();
    let wake_word = match std::env::args().nth(1) {
        Some(word) => word,
        None => config.wake_word.clone(),
    };

    let dir = paths::wakeword_templates_dir(&wake_word);
    std::fs::create_dir_all(&dir).with_context(|| format!("cannot create {}", dir.display()))?;

    println!("Recording {TEMPLATE_COUNT} reference clips for the wake word \"{wake_word}\".");
    println!("Templates will be saved to {}.", dir.display());
    println!("Speak naturally, the way you would address the assistant.");
    println!();

    let mut saved = 0;
    for take in 1..=TEMPLATE_COUNT {
        wait_for_enter(&format!(
            "[{take}/{TEMPLATE_COUNT}] Press Enter, then say \"{wake_word}\"... "
        ))?;
        countdown();

        let samples = record_clip(&config.input_device, config.sample_rate)?;
        let trimmed = trim_silence(&samples, config.sample_rate, SILENCE_RMS);
        if trimmed.is_empty() {
            println!("  heard only silence, skipping this take");
            println!();
            continue;
        }

        let path = dir.join(format!("{wake_word}-{take:02}.wav"));
        wakeword::save_template_wav(&path, &trimmed, config.sample_rate)?;
        let secs = trimmed.len() as f32 / config.sample_rate as f32;
        println!("  saved {} ({secs:.2}s)", path.display());
        println!();
        saved += 1;
    }

    if saved == 0 {
        bail!("no usable recordings captured");
    }

    println!("Done: {saved} template(s) saved.");
    println!("Restart harkd (or start it now) and it will arm with these templates.");
    Ok(())
}

/// Use the daemon config when one exists so recordings match its
/// wake word and sample rate; fall back to defaults otherwise.
fn load_config() -> RuntimeConfig {
    let path = paths::config_file();
    if path.exists() {
        match RuntimeConfig::from_file(&path) {
            Ok(config) => return config,
            Err(e) => eprintln!("ignoring unreadable config: {e}"),
        }
    }
    RuntimeConfig::default()
}

fn wait_for_enter(prompt: &str) -> Result<()> {
    print!("{prompt}");
    std::io::stdout().flush().context("cannot flush stdout")?;
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("cannot read stdin")?;
    Ok(())
}

fn countdown() {
    for n in (1..=3).rev() {
        print!("{n}... ");
        let _ = std::io::stdout().flush();
        std::thread::sleep(Duration::from_millis(400));
    }
    println!("speak now");
}

/// Record for the fixed window, returning mono samples at `target_rate`.
///
/// An empty `device_name` selects the default input device, matching
/// how the daemon resolves its capture device.
fn record_clip(device_name: &str, target_rate: u32) -> Result<Vec<f32>> {
    let host = cpal::default_host();
    let device = if device_name.is_empty() {
        host.default_input_device()
            .context("no default input device")?
    } else {
        host.input_devices()
            .context("cannot enumerate input devices")?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == device_name)
                    .unwrap_or(false)
            })
            .with_context(|| format!("input device '{device_name}' not found"))?
    };

    let default_config = device
        .default_input_config()
        .context("no default input config")?;
    let native_rate = default_config.sample_rate();
    let native_channels = default_config.channels();
    let stream_config = StreamConfig {
        channels: native_channels,
        sample_rate: native_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let captured: Arc<Mutex<Vec<f32>>> = Arc::new(Mutex::new(Vec::new()));
    let failed = Arc::new(AtomicBool::new(false));

    let sink = Arc::clone(&captured);
    let error_flag = Arc::clone(&failed);
    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mono = if native_channels > 1 {
                    to_mono(data, native_channels)
                } else {
                    data.to_vec()
                };
                if let Ok(mut buf) = sink.lock() {
                    buf.extend_from_slice(&mono);
                }
            },
            move |err| {
                eprintln!("input stream error: {err}");
                error_flag.store(true, Ordering::Relaxed);
            },
            None,
        )
        .context("failed to build input stream")?;
    stream.play().context("failed to start input stream")?;

    std::thread::sleep(Duration::from_secs_f32(RECORD_SECS));
    drop(stream);

    if failed.load(Ordering::Relaxed) {
        bail!("input stream failed during recording");
    }

    let mut guard = captured
        .lock()
        .map_err(|_| anyhow!("capture buffer lock poisoned"))?;
    let native = std::mem::take(&mut *guard);
    drop(guard);

    Ok(downsample(&native, native_rate, target_rate))
}

/// Strip leading and trailing silence, keeping one 20ms window of
/// padding on each side. Returns empty if every window is silent.
fn trim_silence(samples: &[f32], sample_rate: u32, threshold: f32) -> Vec<f32> {
    let window = (sample_rate / 50) as usize;
    if window == 0 || samples.len() < window {
        return Vec::new();
    }

    let loud = |w: usize| rms_energy(&samples[w * window..(w + 1) * window]) >= threshold;
    let windows = samples.len() / window;

    let Some(first) = (0..windows).find(|&w| loud(w)) else {
        return Vec::new();
    };
    let last = (0..windows).rev().find(|&w| loud(w)).unwrap_or(first);

    let start = first.saturating_sub(1) * window;
    let end = ((last + 2) * window).min(samples.len());
    samples[start..end].to_vec()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn windows(rate: u32, pattern: &[f32]) -> Vec<f32> {
        let window = (rate / 50) as usize;
        pattern
            .iter()
            .flat_map(|&level| std::iter::repeat_n(level, window))
            .collect()
    }

    #[test]
    fn trim_strips_silent_edges_with_padding() {
        let rate = 16_000;
        let window = (rate / 50) as usize;
        let samples = windows(rate, &[0.0, 0.0, 0.5, 0.5, 0.0, 0.0]);

        let trimmed = trim_silence(&samples, rate, 0.01);

        // One padding window before and after the two loud ones.
        assert_eq!(trimmed.len(), 4 * window);
    }

    #[test]
    fn trim_of_pure_silence_is_empty() {
        let samples = windows(16_000, &[0.0, 0.0, 0.0]);
        assert!(trim_silence(&samples, 16_000, 0.01).is_empty());
    }

    #[test]
    fn trim_keeps_loud_start_and_end() {
        let rate = 16_000;
        let samples = windows(rate, &[0.5, 0.0, 0.5]);
        let trimmed = trim_silence(&samples, rate, 0.01);
        assert_eq!(trimmed.len(), samples.len());
    }

    #[test]
    fn trim_of_short_input_is_empty() {
        assert!(trim_silence(&[0.5; 10], 16_000, 0.01).is_empty());
    }
}
