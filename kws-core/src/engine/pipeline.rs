//! Blocking pipeline worker.
//!
//! ## Per iteration
//!
//! ```text
//! 1. Receive an AudioChunk from the producer channel (bounded wait)
//! 2. Drop chunks not at 16 kHz (the producer resamples)
//! 3. Append to the engine's ring buffer
//! 4. Trigger a cycle: after every chunk, or when the interval elapses
//! ```
//!
//! The loop runs in `spawn_blocking` and exits when `running` is cleared or
//! every sender has been dropped. Cycle failures are logged and counted; they
//! never stop the loop.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, info, warn};

use crate::{
    buffering::chunk::AudioChunk, constants::SAMPLE_RATE, engine::KwsEngine, error::KwsError,
};

pub struct PipelineDiagnostics {
    pub chunks_in: AtomicUsize,
    pub samples_in: AtomicUsize,
    pub chunks_dropped: AtomicUsize,
    pub cycles: AtomicUsize,
    pub classifications: AtomicUsize,
    pub extraction_errors: AtomicUsize,
    pub inference_errors: AtomicUsize,
}

impl Default for PipelineDiagnostics {
    fn default() -> Self {
        Self {
            chunks_in: AtomicUsize::new(0),
            samples_in: AtomicUsize::new(0),
            chunks_dropped: AtomicUsize::new(0),
            cycles: AtomicUsize::new(0),
            classifications: AtomicUsize::new(0),
            extraction_errors: AtomicUsize::new(0),
            inference_errors: AtomicUsize::new(0),
        }
    }
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        self.chunks_in.store(0, Ordering::Relaxed);
        self.samples_in.store(0, Ordering::Relaxed);
        self.chunks_dropped.store(0, Ordering::Relaxed);
        self.cycles.store(0, Ordering::Relaxed);
        self.classifications.store(0, Ordering::Relaxed);
        self.extraction_errors.store(0, Ordering::Relaxed);
        self.inference_errors.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            chunks_in: self.chunks_in.load(Ordering::Relaxed),
            samples_in: self.samples_in.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            cycles: self.cycles.load(Ordering::Relaxed),
            classifications: self.classifications.load(Ordering::Relaxed),
            extraction_errors: self.extraction_errors.load(Ordering::Relaxed),
            inference_errors: self.inference_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub chunks_in: usize,
    pub samples_in: usize,
    pub chunks_dropped: usize,
    pub cycles: usize,
    pub classifications: usize,
    pub extraction_errors: usize,
    pub inference_errors: usize,
}

/// When the worker runs a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// After every received chunk (`deliver_audio` semantics).
    PerChunk,
    /// On a fixed period, independent of chunk arrival.
    Interval(Duration),
}

/// All context the worker needs, passed as one struct so the closure stays tidy.
pub struct PipelineContext {
    pub engine: Arc<KwsEngine>,
    pub chunks: Receiver<AudioChunk>,
    pub running: Arc<AtomicBool>,
    pub trigger: Trigger,
}

/// Longest the worker blocks on the channel before rechecking `running`.
const RECV_POLL: Duration = Duration::from_millis(20);

/// Run the worker until `ctx.running` becomes false or the channel closes.
pub fn run(ctx: PipelineContext) {
    info!(trigger = ?ctx.trigger, "pipeline started");
    let diagnostics = ctx.engine.diagnostics();

    let mut next_tick = match ctx.trigger {
        Trigger::Interval(period) => Some(Instant::now() + period),
        Trigger::PerChunk => None,
    };

    loop {
        // ── 0. Check running flag ─────────────────────────────────────────
        if !ctx.running.load(Ordering::Relaxed) {
            break;
        }

        // ── 1. Receive ────────────────────────────────────────────────────
        let wait = match next_tick {
            Some(tick) => tick.saturating_duration_since(Instant::now()).min(RECV_POLL),
            None => RECV_POLL,
        };
        match ctx.chunks.recv_timeout(wait) {
            Ok(chunk) => ingest(&ctx, &chunk),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                debug!("audio channel closed");
                break;
            }
        }

        // ── 2. Timer trigger ──────────────────────────────────────────────
        if let (Trigger::Interval(period), Some(tick)) = (ctx.trigger, next_tick) {
            let now = Instant::now();
            if now >= tick {
                run_cycle(&ctx.engine);
                // Skip missed ticks instead of bursting to catch up.
                let mut next = tick + period;
                while next <= now {
                    next += period;
                }
                next_tick = Some(next);
            }
        }
    }

    let snap = diagnostics.snapshot();
    info!(
        chunks_in = snap.chunks_in,
        samples_in = snap.samples_in,
        chunks_dropped = snap.chunks_dropped,
        cycles = snap.cycles,
        classifications = snap.classifications,
        extraction_errors = snap.extraction_errors,
        inference_errors = snap.inference_errors,
        "pipeline stopped"
    );
}

fn ingest(ctx: &PipelineContext, chunk: &AudioChunk) {
    let diagnostics = ctx.engine.diagnostics();
    if chunk.sample_rate != SAMPLE_RATE {
        diagnostics.chunks_dropped.fetch_add(1, Ordering::Relaxed);
        warn!(
            rate = chunk.sample_rate,
            expected = SAMPLE_RATE,
            "dropping chunk at wrong sample rate"
        );
        return;
    }
    if chunk.is_empty() {
        return;
    }

    diagnostics.chunks_in.fetch_add(1, Ordering::Relaxed);
    diagnostics
        .samples_in
        .fetch_add(chunk.samples.len(), Ordering::Relaxed);

    match ctx.trigger {
        Trigger::PerChunk => {
            ctx.engine.append_audio(&chunk.samples);
            run_cycle(&ctx.engine);
        }
        Trigger::Interval(_) => ctx.engine.append_audio(&chunk.samples),
    }
}

fn run_cycle(engine: &KwsEngine) {
    match engine.classify() {
        Ok(_) => {}
        Err(e) if e.is_recoverable() => warn!(error = %e, "cycle skipped"),
        Err(KwsError::Invoke(e)) => debug!(error = %e, "engine not ready; cycle skipped"),
        Err(e) => error!(error = %e, "cycle failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    use crossbeam_channel::unbounded;
    use tokio::sync::broadcast::{self, error::TryRecvError};

    use crate::decoder::Command;
    use crate::engine::EngineConfig;
    use crate::inference::reference_model;
    use crate::ipc::events::ClassificationEvent;

    fn recv_event_with_timeout(
        rx: &mut broadcast::Receiver<ClassificationEvent>,
        timeout: Duration,
    ) -> ClassificationEvent {
        let start = Instant::now();
        loop {
            match rx.try_recv() {
                Ok(ev) => return ev,
                Err(TryRecvError::Empty) => {
                    if start.elapsed() >= timeout {
                        panic!("timed out waiting for classification event");
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Closed) => panic!("classification channel closed unexpectedly"),
            }
        }
    }

    fn ready_engine() -> Arc<KwsEngine> {
        let engine = KwsEngine::new(EngineConfig::default()).unwrap();
        engine.initialize(reference_model()).unwrap();
        Arc::new(engine)
    }

    #[test]
    fn per_chunk_trigger_classifies_every_chunk() {
        let engine = ready_engine();
        let mut rx = engine.subscribe_classifications();
        let (tx, chunks) = unbounded();
        let running = Arc::new(AtomicBool::new(true));

        let worker = {
            let ctx = PipelineContext {
                engine: Arc::clone(&engine),
                chunks,
                running: Arc::clone(&running),
                trigger: Trigger::PerChunk,
            };
            thread::spawn(move || run(ctx))
        };

        for _ in 0..3 {
            tx.send(AudioChunk::native(vec![0; 320])).unwrap();
        }
        for expected in 0..3 {
            let ev = recv_event_with_timeout(&mut rx, Duration::from_secs(2));
            assert_eq!(ev.seq, expected);
            assert_eq!(ev.command, Command::Silence);
        }

        drop(tx);
        worker.join().unwrap();

        let snap = engine.diagnostics_snapshot();
        assert_eq!(snap.chunks_in, 3);
        assert_eq!(snap.samples_in, 960);
        assert_eq!(snap.classifications, 3);
    }

    #[test]
    fn wrong_rate_chunks_are_dropped() {
        let engine = ready_engine();
        let (tx, chunks) = unbounded();
        tx.send(AudioChunk::new(vec![0; 480], 48_000)).unwrap();
        drop(tx);

        run(PipelineContext {
            engine: Arc::clone(&engine),
            chunks,
            running: Arc::new(AtomicBool::new(true)),
            trigger: Trigger::PerChunk,
        });

        let snap = engine.diagnostics_snapshot();
        assert_eq!(snap.chunks_dropped, 1);
        assert_eq!(snap.chunks_in, 0);
        assert_eq!(snap.cycles, 0);
        assert_eq!(engine.samples_received(), 0);
    }

    #[test]
    fn interval_trigger_runs_without_audio() {
        let engine = ready_engine();
        let mut rx = engine.subscribe_classifications();
        let (_tx, chunks) = unbounded::<AudioChunk>();
        let running = Arc::new(AtomicBool::new(true));

        let worker = {
            let ctx = PipelineContext {
                engine: Arc::clone(&engine),
                chunks,
                running: Arc::clone(&running),
                trigger: Trigger::Interval(Duration::from_millis(10)),
            };
            thread::spawn(move || run(ctx))
        };

        let first = recv_event_with_timeout(&mut rx, Duration::from_secs(2));
        let second = recv_event_with_timeout(&mut rx, Duration::from_secs(2));
        assert!(second.seq > first.seq);

        running.store(false, Ordering::Relaxed);
        worker.join().unwrap();
        assert_eq!(engine.diagnostics_snapshot().chunks_in, 0);
    }

    #[test]
    fn uninitialized_engine_keeps_the_loop_alive() {
        let engine = Arc::new(KwsEngine::new(EngineConfig::default()).unwrap());
        let (tx, chunks) = unbounded();
        for _ in 0..2 {
            tx.send(AudioChunk::native(vec![5; 100])).unwrap();
        }
        drop(tx);

        run(PipelineContext {
            engine: Arc::clone(&engine),
            chunks,
            running: Arc::new(AtomicBool::new(true)),
            trigger: Trigger::PerChunk,
        });

        let snap = engine.diagnostics_snapshot();
        assert_eq!(snap.chunks_in, 2);
        assert_eq!(snap.cycles, 0);
        assert_eq!(engine.samples_received(), 200);
    }

    #[test]
    fn cleared_flag_stops_before_receiving() {
        let engine = ready_engine();
        let (tx, chunks) = unbounded();
        tx.send(AudioChunk::native(vec![0; 10])).unwrap();

        run(PipelineContext {
            engine: Arc::clone(&engine),
            chunks,
            running: Arc::new(AtomicBool::new(false)),
            trigger: Trigger::PerChunk,
        });
        assert_eq!(engine.diagnostics_snapshot().chunks_in, 0);
    }
}
