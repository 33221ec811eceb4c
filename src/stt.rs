//! Transcription adapter: ships captured utterances to the sidecar ASR
//! server as WAV and returns the recognized text.

use std::io::Cursor;
use std::time::Duration;

use tracing::debug;

use crate::error::{HarkError, Result};
use crate::utterance::Utterance;
use crate::vad::rms_energy;

/// Sidecar request deadline. Generous; utterances are capped at seconds.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Transcription capability.
///
/// `Ok(None)` means the audio held no recognizable speech; that is not an
/// error.
pub trait Transcribe: Send {
    /// Transcribe one utterance.
    ///
    /// # Errors
    ///
    /// Returns a transcription error when the backend fails or answers in
    /// an unexpected shape.
    fn transcribe(&mut self, utterance: &Utterance) -> Result<Option<String>>;
}

/// HTTP client for a sidecar transcription server.
///
/// POSTs the utterance as `audio/wav` to `{base}/transcribe` and expects
/// `{"text": "..."}` back. Empty or whitespace-only text maps to `None`.
pub struct HttpTranscriber {
    agent: ureq::Agent,
    url: String,
}

impl HttpTranscriber {
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            agent: ureq::agent(),
            url: format!("{}/transcribe", base_url.trim_end_matches('/')),
        }
    }
}

impl Transcribe for HttpTranscriber {
    fn transcribe(&mut self, utterance: &Utterance) -> Result<Option<String>> {
        let wav = encode_wav(&utterance.samples, utterance.sample_rate)?;
        debug!(
            bytes = wav.len(),
            duration_ms = utterance.duration().as_millis() as u64,
            rms = rms_energy(&utterance.samples),
            "sending utterance for transcription"
        );

        let response = self
            .agent
            .post(&self.url)
            .set("Content-Type", "audio/wav")
            .timeout(REQUEST_TIMEOUT)
            .send_bytes(&wav)
            .map_err(|e| HarkError::Transcription(format!("request failed: {e}")))?;

        let body = response
            .into_string()
            .map_err(|e| HarkError::Transcription(format!("cannot read response: {e}")))?;
        let value: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| HarkError::Transcription(format!("malformed response: {e}")))?;

        let text = value
            .get("text")
            .and_then(|t| t.as_str())
            .ok_or_else(|| HarkError::Transcription("response missing text field".to_owned()))?;

        let trimmed = text.trim();
        if trimmed.is_empty() {
            Ok(None)
        } else {
            Ok(Some(trimmed.to_owned()))
        }
    }
}

/// Encode samples as an in-memory 16-bit PCM WAV.
fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| HarkError::Transcription(format!("cannot encode WAV: {e}")))?;
        for &s in samples {
            let sample_i16 = (s * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| HarkError::Transcription(format!("WAV write error: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| HarkError::Transcription(format!("WAV finalize error: {e}")))?;
    }
    Ok(cursor.into_inner())
}
