//! Always-listening voice assistant daemon.
//!
//! Boots the capture pipeline on a dedicated thread, the speech output
//! worker, and the localhost control API, then runs until SIGINT or
//! SIGTERM. The pipeline exiting on its own means the capture device
//! failed, which is fatal.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use hark::audio::{CpalFrameSource, CpalPlayback};
use hark::config::{ConfigStore, RuntimeConfig};
use hark::history::ConversationStore;
use hark::llm::GenerateClient;
use hark::pipeline::{Pipeline, PipelineContext};
use hark::server::ControlServer;
use hark::speech::{CommandSynthesizer, spawn_speaker};
use hark::stt::HttpTranscriber;
use hark::vad::EnergyVad;
use hark::wakeword::{TemplateSpotter, WakeGate};
use hark::{logging, paths};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = logging::init(&paths::logs_dir()).context("failed to initialize logging")?;

    info!("harkd {} starting", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(paths::config_file);
    let config = load_or_init_config(&config_path)?;
    info!(
        path = %config_path.display(),
        enabled = config.enabled,
        wake_word = %config.wake_word,
        "configuration loaded"
    );

    let store = ConfigStore::with_persistence(config.clone(), config_path);
    let history = Arc::new(ConversationStore::with_persistence(
        config.history_capacity(),
        paths::history_file(),
    ));

    // Audio in. A device that cannot be opened is fatal.
    let frames = CpalFrameSource::open(&config).context("cannot open capture device")?;

    let spotter = TemplateSpotter::for_wake_word(&config.wake_word, config.sample_rate)
        .context("cannot load wake word templates")?;
    if !spotter.is_armed() {
        warn!(
            wake_word = %config.wake_word,
            dir = %paths::wakeword_templates_dir(&config.wake_word).display(),
            "no wake word templates found; record WAV files there to arm the assistant"
        );
    }
    let gate = WakeGate::new(spotter, &config.wake_word);

    let vad = EnergyVad::new(config.vad_aggressiveness);
    let transcriber = HttpTranscriber::new(&config.asr_url);
    let llm = GenerateClient::new();

    // Speech output worker.
    let synthesizer = CommandSynthesizer::new(&config.tts_command)?;
    let playback = CpalPlayback::new(&config.output_device);
    let (speech, speaker_handle) =
        spawn_speaker(Box::new(synthesizer), Box::new(playback), store.clone())?;

    let stop = Arc::new(AtomicBool::new(false));
    let ctx = PipelineContext {
        config: store.clone(),
        history: Arc::clone(&history),
        speech: speech.clone(),
        stop: Arc::clone(&stop),
    };
    let mut pipeline = Pipeline::new(frames, gate, vad, transcriber, llm, ctx);

    let pipeline_thread = std::thread::Builder::new()
        .name("pipeline".to_owned())
        .spawn(move || pipeline.run())
        .context("failed to spawn pipeline thread")?;
    let mut pipeline_done = tokio::task::spawn_blocking(move || pipeline_thread.join());

    // Control surface.
    let cancel = CancellationToken::new();
    let server = ControlServer::start(
        &config.control_addr,
        store.clone(),
        Arc::clone(&history),
        cancel.clone(),
    )
    .await?;
    info!(addr = %server.addr(), "control API ready");

    let joined = tokio::select! {
        () = shutdown_signal() => {
            info!("shutdown signal received");
            stop.store(true, Ordering::Relaxed);
            pipeline_done.await
        }
        res = &mut pipeline_done => {
            warn!("pipeline exited on its own, shutting down");
            res
        }
    };
    cancel.cancel();

    let pipeline_result = match joined.context("pipeline watcher failed")? {
        Ok(result) => result,
        Err(_) => anyhow::bail!("pipeline thread panicked"),
    };

    // Dropping the last queue handle lets the speech worker drain and exit.
    drop(speech);
    if tokio::task::spawn_blocking(move || speaker_handle.join())
        .await
        .map(|r| r.is_err())
        .unwrap_or(true)
    {
        warn!("speech worker did not shut down cleanly");
    }

    pipeline_result.context("audio pipeline failed")?;
    info!("harkd stopped");
    Ok(())
}

/// Load the config file, writing defaults on first run.
fn load_or_init_config(path: &Path) -> anyhow::Result<RuntimeConfig> {
    if path.exists() {
        return Ok(RuntimeConfig::from_file(path)?);
    }
    let config = RuntimeConfig::default();
    config
        .save_to_file(path)
        .with_context(|| format!("cannot write default config to {}", path.display()))?;
    info!(path = %path.display(), "wrote default configuration");
    Ok(config)
}

/// Resolves on SIGINT or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
