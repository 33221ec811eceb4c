//! Error types for the hark daemon.

/// Ways an LLM request can fail.
///
/// `Unreachable` and `Timeout` are transient: the orchestrator grants them a
/// single retry with backoff. `ServerError` and `MalformedResponse` surface
/// immediately.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LlmError {
    /// The endpoint could not be reached at the transport level.
    #[error("LLM endpoint unreachable: {0}")]
    Unreachable(String),

    /// The request exceeded its deadline.
    #[error("LLM request timed out")]
    Timeout,

    /// The endpoint answered with a non-success HTTP status.
    #[error("LLM server returned HTTP {0}")]
    ServerError(u16),

    /// The response body was not in the expected shape.
    #[error("malformed LLM response: {0}")]
    MalformedResponse(String),
}

impl LlmError {
    /// Whether a single bounded retry is worth attempting.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Timeout)
    }
}

/// Top-level error type for the daemon.
#[derive(Debug, thiserror::Error)]
pub enum HarkError {
    /// No usable audio input device at startup. Fatal.
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The audio input device disappeared mid-stream. Fatal.
    #[error("audio device lost: {0}")]
    DeviceLost(String),

    /// The transcription backend failed on a captured utterance.
    #[error("transcription failed: {0}")]
    Transcription(String),

    /// An LLM request failed after any retry was exhausted.
    #[error(transparent)]
    Llm(#[from] LlmError),

    /// Speech rendering or playback failed.
    #[error("playback error: {0}")]
    Playback(String),

    /// A runtime config write carried an out-of-range value and was rejected.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The config file could not be read, parsed, or written.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type used throughout the crate.
pub type Result<T> = std::result::Result<T, HarkError>;
