//! `kws`: plays a WAV file through the keyword-spotting pipeline and logs
//! every classification.
//!
//! ```text
//! WAV reader (spawn_blocking) ─► crossbeam channel ─► pipeline::run (spawn_blocking)
//!                                                          │
//!                                     ClassificationEvent / StatusEvent broadcast
//!                                                          │
//!                                                 async forwarders → tracing
//! ```

mod settings;
mod wav;

use std::path::Path;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use crossbeam_channel::{bounded, Sender};
use kws_core::engine::pipeline::{self, PipelineContext};
use kws_core::inference::reference_model;
use kws_core::{AudioChunk, Command, KwsEngine, Model};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use settings::{load_settings, settings_path, AppSettings};

/// Chunks buffered between the reader and the pipeline.
const CHUNK_QUEUE: usize = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("kws=info,kws_core=info")),
        )
        .init();

    info!("kws starting");

    let path = settings_path();
    let mut app_settings = load_settings(&path);
    app_settings.apply_env_overrides();
    info!(
        settings_path = ?path,
        model = ?app_settings.model_path,
        input = ?app_settings.input_wav,
        chunk_ms = app_settings.chunk_ms,
        trigger = ?app_settings.trigger,
        realtime = app_settings.realtime,
        "settings loaded"
    );

    // ── Engine setup ──────────────────────────────────────────────────────
    let engine = Arc::new(KwsEngine::new(app_settings.engine_config())?);
    engine
        .initialize(load_model(app_settings.model_path.as_deref())?)
        .context("model initialization failed")?;

    let forwarders = spawn_forwarders(&engine, app_settings.log_silence);

    // ── Pipeline ──────────────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let (tx, rx) = bounded::<AudioChunk>(CHUNK_QUEUE);
    let worker = tokio::task::spawn_blocking({
        let ctx = PipelineContext {
            engine: Arc::clone(&engine),
            chunks: rx,
            running: Arc::clone(&running),
            trigger: app_settings.pipeline_trigger(),
        };
        move || pipeline::run(ctx)
    });

    // ── Producer ──────────────────────────────────────────────────────────
    let producer = tokio::task::spawn_blocking({
        let settings = app_settings.clone();
        let running = Arc::clone(&running);
        move || play(&settings, &tx, &running)
    });

    tokio::select! {
        res = producer => {
            match res {
                Ok(Ok(sent)) => info!(chunks = sent, "input exhausted"),
                Ok(Err(e)) => warn!("audio producer failed: {e:#}"),
                Err(e) => warn!("audio producer panicked: {e}"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            running.store(false, Ordering::SeqCst);
        }
    }

    // The producer dropped its sender; the worker drains what is queued and exits.
    if let Err(e) = worker.await {
        warn!("pipeline worker panicked: {e}");
    }
    running.store(false, Ordering::SeqCst);

    // Let forwarders flush events already in their queues.
    tokio::time::sleep(Duration::from_millis(50)).await;
    for task in forwarders {
        task.abort();
    }

    let snap = engine.diagnostics_snapshot();
    engine.shutdown();
    info!(
        cycles = snap.cycles,
        classifications = snap.classifications,
        errors = snap.extraction_errors + snap.inference_errors,
        "kws finished"
    );
    Ok(())
}

/// Model from `path`, or the built-in reference model when none is configured
/// or the file is missing.
fn load_model(path: Option<&Path>) -> anyhow::Result<Model> {
    match path {
        Some(p) if p.exists() => {
            let bytes = std::fs::read(p).with_context(|| format!("reading {}", p.display()))?;
            info!(path = %p.display(), bytes = bytes.len(), "loading model");
            Ok(Model::from_bytes(bytes))
        }
        Some(p) => {
            warn!("model file not found at {}, using reference model", p.display());
            Ok(reference_model())
        }
        None => {
            warn!("no model configured, using reference model (untrained)");
            Ok(reference_model())
        }
    }
}

/// Send the configured input in `chunk_ms` pieces. Returns the chunk count.
fn play(settings: &AppSettings, tx: &Sender<AudioChunk>, running: &AtomicBool) -> anyhow::Result<usize> {
    let samples = match settings.input_wav.as_deref() {
        Some(p) => wav::read_for_pipeline(p)?,
        None => {
            warn!("no input WAV configured, playing one second of silence");
            vec![0; kws_core::constants::AUDIO_CAPACITY]
        }
    };

    let chunk_len = settings.chunk_samples().max(1);
    let pace = Duration::from_millis(u64::from(settings.chunk_ms));
    let mut sent = 0;
    for piece in samples.chunks(chunk_len) {
        if !running.load(Ordering::Relaxed) {
            break;
        }
        if tx.send(AudioChunk::native(piece.to_vec())).is_err() {
            debug!("pipeline closed the channel");
            break;
        }
        sent += 1;
        if settings.realtime {
            std::thread::sleep(pace);
        }
    }
    Ok(sent)
}

/// Log classification and status events as they are published.
fn spawn_forwarders(engine: &KwsEngine, log_silence: bool) -> Vec<tokio::task::JoinHandle<()>> {
    let mut classifications = engine.subscribe_classifications();
    let mut status = engine.subscribe_status();

    let classification_task = tokio::spawn(async move {
        loop {
            match classifications.recv().await {
                Ok(ev) => {
                    let json = serde_json::to_string(&ev).unwrap_or_default();
                    if ev.command != Command::Silence || log_silence {
                        info!(
                            seq = ev.seq,
                            label = %ev.label,
                            confidence = ev.confidence,
                            event = %json,
                            "classification"
                        );
                    } else {
                        debug!(seq = ev.seq, confidence = ev.confidence, "silence");
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!("classification receiver lagged by {n} events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let status_task = tokio::spawn(async move {
        loop {
            match status.recv().await {
                Ok(ev) => match ev.detail {
                    Some(detail) => warn!(state = ?ev.state, %detail, "pipeline status"),
                    None => info!(state = ?ev.state, "pipeline status"),
                },
                Err(RecvError::Lagged(n)) => warn!("status receiver lagged by {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    vec![classification_task, status_task]
}
