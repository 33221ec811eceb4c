//! Localhost control surface for the daemon.
//!
//! Exposes runtime configuration, conversation history, and a status
//! summary over a small JSON API so the assistant can be inspected and
//! reconfigured without restarting.
//!
//! ## Endpoints
//!
//! - `GET /api/config` — current runtime configuration
//! - `POST /api/config` — apply a partial update
//! - `GET /api/status` — daemon status summary
//! - `GET /api/history` — stored conversation turns
//! - `DELETE /api/history` — clear stored turns

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{ConfigPatch, ConfigStore, RuntimeConfig};
use crate::error::{HarkError, Result};
use crate::history::{ConversationStore, Turn};

/// Response from the `GET /api/status` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Whether the assistant is currently listening for its wake word.
    pub enabled: bool,
    /// Daemon version.
    pub version: String,
    /// Seconds since the control server came up.
    pub uptime_secs: u64,
    /// Number of conversation turns currently stored.
    pub turns_stored: usize,
}

/// Error payload for rejected requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable reason the request was rejected.
    pub error: String,
}

/// Shared state for axum handlers.
#[derive(Clone)]
struct AppState {
    config: ConfigStore,
    history: Arc<ConversationStore>,
    started_at: Instant,
}

/// The control-surface HTTP server.
pub struct ControlServer {
    /// The address the server is listening on.
    addr: SocketAddr,
    /// Handle to the background server task.
    handle: JoinHandle<()>,
}

impl ControlServer {
    /// Start the control server.
    ///
    /// Binds to `bind_addr` (use port `0` for auto-assign) and serves in a
    /// background tokio task until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP listener cannot bind.
    pub async fn start(
        bind_addr: &str,
        config: ConfigStore,
        history: Arc<ConversationStore>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let state = AppState {
            config,
            history,
            started_at: Instant::now(),
        };

        let app = Router::new()
            .route(
                "/api/config",
                get(handle_get_config).post(handle_update_config),
            )
            .route("/api/status", get(handle_status))
            .route(
                "/api/history",
                get(handle_get_history).delete(handle_clear_history),
            )
            .with_state(state);

        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| HarkError::Config(format!("control server bind failed: {e}")))?;

        let addr = listener
            .local_addr()
            .map_err(|e| HarkError::Config(format!("failed to get local addr: {e}")))?;

        info!("control server listening on http://{addr}/api");

        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(cancel.cancelled_owned());
            if let Err(e) = serve.await {
                tracing::error!("control server error: {e}");
            }
        });

        Ok(Self { addr, handle })
    }

    /// Returns the address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Abort the server task.
    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// `GET /api/config` — current runtime configuration.
async fn handle_get_config(State(state): State<AppState>) -> Json<RuntimeConfig> {
    Json(state.config.get())
}

/// `POST /api/config` — apply a partial update.
///
/// An update that fails validation is rejected whole: no field of it is
/// applied and the running configuration is unchanged.
async fn handle_update_config(
    State(state): State<AppState>,
    Json(patch): Json<ConfigPatch>,
) -> axum::response::Response {
    let before = state.config.get();
    match state.config.update(&patch) {
        Ok(updated) => {
            if !before.history_enabled && updated.history_enabled {
                info!("history re-enabled, starting from a clean context");
                state.history.clear();
            }
            state.history.set_capacity(updated.history_capacity());
            (StatusCode::OK, Json(updated)).into_response()
        }
        Err(e) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorBody {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

/// `GET /api/status` — daemon status summary.
async fn handle_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        enabled: state.config.get().enabled,
        version: env!("CARGO_PKG_VERSION").to_owned(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        turns_stored: state.history.len(),
    })
}

/// `GET /api/history` — stored conversation turns, oldest first.
async fn handle_get_history(State(state): State<AppState>) -> Json<Vec<Turn>> {
    Json(state.history.snapshot())
}

/// `DELETE /api/history` — clear stored turns.
async fn handle_clear_history(State(state): State<AppState>) -> StatusCode {
    state.history.clear();
    info!("conversation history cleared");
    StatusCode::NO_CONTENT
}
