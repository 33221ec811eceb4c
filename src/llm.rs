//! LLM client for an Ollama-style generate endpoint: prompt assembly from
//! conversation history, one-shot requests, and the bounded retry policy.

use std::time::Duration;

use tracing::warn;

use crate::error::LlmError;
use crate::history::Turn;

/// Spoken when the endpoint stays unreachable after the retry.
pub const FALLBACK_REPLY: &str = "I'm sorry, I cannot connect to the language model server.";

/// Pause before the single retry of a transient failure.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Attempts per request: the original call plus one retry.
const MAX_ATTEMPTS: u32 = 2;

/// One outbound request.
pub struct LlmRequest<'a> {
    /// Endpoint base URL, e.g. `http://localhost:11434`.
    pub endpoint: String,
    /// Model name.
    pub model: &'a str,
    /// The current user prompt. Not part of `history`.
    pub prompt: &'a str,
    /// Prior turns to send as context; `None` when history is disabled.
    pub history: Option<&'a [Turn]>,
    /// Per-attempt deadline.
    pub timeout: Duration,
}

/// LLM query capability. One attempt per call; the retry policy sits
/// above in [`ask_with_retry`].
pub trait QueryLlm: Send {
    /// Issue one request.
    ///
    /// # Errors
    ///
    /// Returns the failure classified per [`LlmError`].
    fn ask(&mut self, request: &LlmRequest<'_>) -> std::result::Result<String, LlmError>;
}

/// Issue a request, retrying once after `backoff` when the failure is
/// transient.
///
/// # Errors
///
/// Non-transient failures surface immediately; transient ones after the
/// retry is spent.
pub fn ask_with_retry(
    client: &mut dyn QueryLlm,
    request: &LlmRequest<'_>,
    backoff: Duration,
) -> std::result::Result<String, LlmError> {
    let mut attempt = 1;
    loop {
        match client.ask(request) {
            Ok(reply) => return Ok(reply),
            Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                warn!(attempt, error = %e, "LLM request failed, retrying after backoff");
                std::thread::sleep(backoff);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Blocking HTTP client for the `/api/generate` endpoint.
pub struct GenerateClient {
    agent: ureq::Agent,
}

impl GenerateClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            agent: ureq::agent(),
        }
    }
}

impl Default for GenerateClient {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryLlm for GenerateClient {
    fn ask(&mut self, request: &LlmRequest<'_>) -> std::result::Result<String, LlmError> {
        let url = format!("{}/api/generate", request.endpoint.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": request.model,
            "prompt": build_prompt(request.prompt, request.history),
            "stream": false,
        });

        let response = match self
            .agent
            .post(&url)
            .set("Content-Type", "application/json")
            .timeout(request.timeout)
            .send_string(&body.to_string())
        {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => return Err(LlmError::ServerError(code)),
            Err(ureq::Error::Transport(transport)) => return Err(map_transport(&transport)),
        };

        let body = response.into_string().map_err(map_read_error)?;
        let value: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| LlmError::MalformedResponse(format!("invalid JSON: {e}")))?;

        value
            .get("response")
            .and_then(|r| r.as_str())
            .map(|r| r.trim().to_owned())
            .ok_or_else(|| LlmError::MalformedResponse("response field missing".to_owned()))
    }
}

/// Render the outbound prompt: prior turns as context lines, then the
/// current exchange.
fn build_prompt(prompt: &str, history: Option<&[Turn]>) -> String {
    let mut out = String::new();
    if let Some(turns) = history {
        for turn in turns {
            out.push_str(turn.role.as_str());
            out.push_str(": ");
            out.push_str(&turn.text);
            out.push('\n');
        }
    }
    out.push_str("user: ");
    out.push_str(prompt);
    out.push_str("\nassistant:");
    out
}

fn map_transport(transport: &ureq::Transport) -> LlmError {
    if let Some(io) = find_io_error(transport) {
        if matches!(
            io.kind(),
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
        ) {
            return LlmError::Timeout;
        }
    }
    LlmError::Unreachable(transport.to_string())
}

fn map_read_error(e: std::io::Error) -> LlmError {
    if matches!(
        e.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
    ) {
        LlmError::Timeout
    } else {
        LlmError::Unreachable(e.to_string())
    }
}

/// Walk the source chain looking for the underlying I/O error.
fn find_io_error<'a>(
    err: &'a (dyn std::error::Error + 'static),
) -> Option<&'a std::io::Error> {
    let mut source = err.source();
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return Some(io);
        }
        source = e.source();
    }
    None
}
