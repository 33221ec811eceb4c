//! Hark: an always-listening voice assistant daemon.
//!
//! The daemon runs a single conversation pipeline:
//! Microphone → Wake word → Utterance capture → Transcription → LLM → Speech
//!
//! # Architecture
//!
//! - **Audio capture**: 30 ms microphone frames via `cpal`
//! - **Wake word**: MFCC + DTW template spotting over a sliding window
//! - **Utterance capture**: energy VAD with silence and duration limits
//! - **Transcription**: HTTP sidecar speaking WAV in, JSON out
//! - **LLM**: blocking client for an Ollama-style `/api/generate` endpoint
//! - **Speech output**: external renderer played back via `cpal`
//!
//! A localhost control API ([`server`]) reads and hot-reloads the runtime
//! configuration and conversation history while the pipeline runs.

pub mod audio;
pub mod config;
pub mod error;
pub mod history;
pub mod llm;
pub mod logging;
pub mod paths;
pub mod pipeline;
pub mod server;
pub mod speech;
pub mod stt;
pub mod utterance;
pub mod vad;
pub mod wakeword;

pub use config::{ConfigPatch, ConfigStore, RuntimeConfig};
pub use error::{HarkError, LlmError, Result};
pub use history::{ConversationStore, Role, Turn};
pub use pipeline::{Pipeline, PipelineContext, PipelineState};
pub use server::ControlServer;
