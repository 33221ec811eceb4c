//! Runtime configuration: types, validation, TOML persistence, and the
//! shared store read by the pipeline and written by the control surface.

use std::path::Path;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{HarkError, Result};

/// Sample rates the capture path accepts, in Hz.
pub const SUPPORTED_SAMPLE_RATES: [u32; 6] = [8000, 16_000, 22_050, 32_000, 44_100, 48_000];

/// Runtime settings for the daemon.
///
/// Loaded from `config.toml` at startup and hot-written by the control
/// surface. Every field has a default so a partial file loads cleanly.
/// `sample_rate`, `input_device`, `output_device`, `asr_url`, and
/// `control_addr` are read once at startup; the rest take effect on the
/// next pipeline cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Master switch. When false the pipeline drains frames without
    /// processing them.
    pub enabled: bool,

    /// LLM endpoint host.
    pub endpoint_host: String,

    /// LLM endpoint port.
    pub endpoint_port: u16,

    /// Model name sent with each LLM request.
    pub model_name: String,

    /// Playback volume, 0-100.
    pub volume: u8,

    /// Whether stored conversation turns are sent as context with LLM
    /// requests. Turns are recorded either way.
    pub history_enabled: bool,

    /// Conversation exchanges to retain. The store holds twice this many
    /// turns (one user and one assistant turn per exchange).
    pub max_conversation_turns: usize,

    /// Wake word. Selects the reference recording set under the data dir.
    pub wake_word: String,

    /// Capture sample rate in Hz. Applied at startup.
    pub sample_rate: u32,

    /// Voice-activity aggressiveness, 0 (permissive) to 3 (strict).
    pub vad_aggressiveness: u8,

    /// LLM request timeout in seconds.
    pub request_timeout_secs: u64,

    /// Trailing silence that ends an utterance, in milliseconds.
    pub silence_timeout_ms: u64,

    /// Hard cap on utterance length in seconds.
    pub max_utterance_secs: u64,

    /// Input device name. Empty selects the system default. Applied at
    /// startup.
    pub input_device: String,

    /// Output device name. Empty selects the system default. Applied at
    /// startup.
    pub output_device: String,

    /// Transcription sidecar base URL. Applied at startup.
    pub asr_url: String,

    /// Speech renderer command line. The text to speak is appended as the
    /// final argument; the command writes WAV audio to stdout. Applied at
    /// startup.
    pub tts_command: String,

    /// Control API bind address. Applied at startup.
    pub control_addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint_host: "localhost".to_owned(),
            endpoint_port: 11434,
            model_name: "llama2".to_owned(),
            volume: 75,
            history_enabled: true,
            max_conversation_turns: 10,
            wake_word: "hark".to_owned(),
            sample_rate: 16_000,
            vad_aggressiveness: 3,
            request_timeout_secs: 30,
            silence_timeout_ms: 1000,
            max_utterance_secs: 10,
            input_device: String::new(),
            output_device: String::new(),
            asr_url: "http://127.0.0.1:8317".to_owned(),
            tts_command: "espeak-ng --stdout".to_owned(),
            control_addr: "127.0.0.1:8321".to_owned(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if a
    /// parsed value is out of range.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| HarkError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| HarkError::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                HarkError::Config(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| HarkError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, contents)
            .map_err(|e| HarkError::Config(format!("failed to write {}: {e}", path.display())))?;
        Ok(())
    }

    /// Check every field against its allowed range.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.volume > 100 {
            return Err(HarkError::InvalidConfig(format!(
                "volume must be 0-100, got {}",
                self.volume
            )));
        }
        if self.vad_aggressiveness > 3 {
            return Err(HarkError::InvalidConfig(format!(
                "vad_aggressiveness must be 0-3, got {}",
                self.vad_aggressiveness
            )));
        }
        if self.max_conversation_turns == 0 {
            return Err(HarkError::InvalidConfig(
                "max_conversation_turns must be at least 1".to_owned(),
            ));
        }
        if self.endpoint_port == 0 {
            return Err(HarkError::InvalidConfig(
                "endpoint_port must be nonzero".to_owned(),
            ));
        }
        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(HarkError::InvalidConfig(format!(
                "sample_rate must be one of {SUPPORTED_SAMPLE_RATES:?}, got {}",
                self.sample_rate
            )));
        }
        if self.wake_word.trim().is_empty() {
            return Err(HarkError::InvalidConfig(
                "wake_word must not be empty".to_owned(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(HarkError::InvalidConfig(
                "request_timeout_secs must be at least 1".to_owned(),
            ));
        }
        if self.max_utterance_secs == 0 {
            return Err(HarkError::InvalidConfig(
                "max_utterance_secs must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }

    /// Turns the history store retains: two per conversation exchange.
    #[must_use]
    pub fn history_capacity(&self) -> usize {
        self.max_conversation_turns * 2
    }

    /// Base URL of the LLM endpoint.
    #[must_use]
    pub fn endpoint_url(&self) -> String {
        format!("http://{}:{}", self.endpoint_host, self.endpoint_port)
    }
}

/// A partial configuration update. Unset fields keep their current values.
///
/// Unknown fields in the incoming document are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigPatch {
    pub enabled: Option<bool>,
    pub endpoint_host: Option<String>,
    pub endpoint_port: Option<u16>,
    pub model_name: Option<String>,
    pub volume: Option<u8>,
    pub history_enabled: Option<bool>,
    pub max_conversation_turns: Option<usize>,
    pub wake_word: Option<String>,
    pub sample_rate: Option<u32>,
    pub vad_aggressiveness: Option<u8>,
    pub request_timeout_secs: Option<u64>,
    pub silence_timeout_ms: Option<u64>,
    pub max_utterance_secs: Option<u64>,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub asr_url: Option<String>,
    pub tts_command: Option<String>,
    pub control_addr: Option<String>,
}

impl ConfigPatch {
    /// Produce a new config with this patch layered over `current`.
    #[must_use]
    pub fn apply_to(&self, current: &RuntimeConfig) -> RuntimeConfig {
        let mut next = current.clone();
        if let Some(v) = self.enabled {
            next.enabled = v;
        }
        if let Some(v) = &self.endpoint_host {
            next.endpoint_host = v.clone();
        }
        if let Some(v) = self.endpoint_port {
            next.endpoint_port = v;
        }
        if let Some(v) = &self.model_name {
            next.model_name = v.clone();
        }
        if let Some(v) = self.volume {
            next.volume = v;
        }
        if let Some(v) = self.history_enabled {
            next.history_enabled = v;
        }
        if let Some(v) = self.max_conversation_turns {
            next.max_conversation_turns = v;
        }
        if let Some(v) = &self.wake_word {
            next.wake_word = v.clone();
        }
        if let Some(v) = self.sample_rate {
            next.sample_rate = v;
        }
        if let Some(v) = self.vad_aggressiveness {
            next.vad_aggressiveness = v;
        }
        if let Some(v) = self.request_timeout_secs {
            next.request_timeout_secs = v;
        }
        if let Some(v) = self.silence_timeout_ms {
            next.silence_timeout_ms = v;
        }
        if let Some(v) = self.max_utterance_secs {
            next.max_utterance_secs = v;
        }
        if let Some(v) = &self.input_device {
            next.input_device = v.clone();
        }
        if let Some(v) = &self.output_device {
            next.output_device = v.clone();
        }
        if let Some(v) = &self.asr_url {
            next.asr_url = v.clone();
        }
        if let Some(v) = &self.tts_command {
            next.tts_command = v.clone();
        }
        if let Some(v) = &self.control_addr {
            next.control_addr = v.clone();
        }
        next
    }
}

/// Process-wide configuration cell: one writer (the control surface), many
/// cheap snapshot readers.
///
/// An invalid patch is rejected whole; the stored config never holds a
/// value that fails [`RuntimeConfig::validate`].
#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<RwLock<RuntimeConfig>>,
    path: Option<Arc<PathBuf>>,
}

impl ConfigStore {
    /// Create a store with no backing file.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
            path: None,
        }
    }

    /// Create a store that writes `path` after every successful update.
    #[must_use]
    pub fn with_persistence(config: RuntimeConfig, path: PathBuf) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
            path: Some(Arc::new(path)),
        }
    }

    /// Snapshot the current configuration.
    #[must_use]
    pub fn get(&self) -> RuntimeConfig {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply a patch: merge, validate, persist, swap.
    ///
    /// The lock is held across the whole sequence so concurrent writers
    /// serialize and a failed step leaves the stored config untouched.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when the merged result fails validation, or
    /// a config error when persistence fails. Either way the stored config
    /// keeps its previous value.
    pub fn update(&self, patch: &ConfigPatch) -> Result<RuntimeConfig> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let merged = patch.apply_to(&guard);
        merged.validate()?;
        if let Some(path) = self.path.as_deref() {
            merged.save_to_file(path)?;
        }
        *guard = merged.clone();
        Ok(merged)
    }
}
