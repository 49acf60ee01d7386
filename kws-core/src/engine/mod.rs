//! `KwsEngine`: pipeline controller and lifecycle owner.
//!
//! ## Lifecycle
//!
//! ```text
//! KwsEngine::new()           → Uninitialized
//!     └─► initialize(model)  → Ready            (ring zeroed, model bound)
//!         ├─► process_chunk / classify
//!         │                  → Classifying → Ready   (one full cycle)
//!         └─► shutdown()     → ShutDown         (model released)
//!                 └─► initialize(model) → Ready (arena reused)
//! ```
//!
//! A cycle is snapshot → extract → invoke → decode → publish. Cycles on one
//! engine never overlap: each holds the cycle lock from snapshot to publish.
//! Producers only touch the ring buffer, which has its own lock, so
//! `append_audio` never waits for inference.

pub mod pipeline;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    buffering::AudioRingHandle,
    constants::{AudioWindow, AUDIO_CAPACITY, TENSOR_ARENA_SIZE},
    decoder::{decode, Classification},
    error::{InvokeError, KwsError, Result},
    features::{build_generator, FeatureGenerator, FeatureMatrix, FeatureStrategy},
    inference::{InferenceEngine, Model, ModelHandle},
    ipc::events::{ClassificationEvent, PipelineState, StatusEvent},
};

use pipeline::{DiagnosticsSnapshot, PipelineDiagnostics};

/// Configuration for `KwsEngine`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Inference arena in bytes. Allocated once. Default: 10 KiB.
    pub arena_size: usize,
    /// Feature front end. Default: `Energy`.
    pub feature_strategy: FeatureStrategy,
    /// Events buffered per broadcast channel for slow subscribers.
    /// Default: 64.
    pub broadcast_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            arena_size: TENSOR_ARENA_SIZE,
            feature_strategy: FeatureStrategy::Energy,
            broadcast_capacity: 64,
        }
    }
}

/// Buffers reused by every cycle.
struct CycleScratch {
    window: Box<AudioWindow>,
    features: FeatureMatrix,
    generator: Box<dyn FeatureGenerator>,
}

/// The top-level engine handle.
///
/// `KwsEngine` is `Send + Sync`; wrap it in `Arc` to share it between an
/// audio producer, the pipeline worker and event forwarders.
pub struct KwsEngine {
    config: EngineConfig,
    model: ModelHandle,
    ring: AudioRingHandle,
    /// Held for the whole of a cycle and for lifecycle transitions.
    cycle: Mutex<CycleScratch>,
    state: Mutex<PipelineState>,
    classification_tx: broadcast::Sender<ClassificationEvent>,
    status_tx: broadcast::Sender<StatusEvent>,
    seq: AtomicU64,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl KwsEngine {
    /// Engine backed by the built-in arena interpreter.
    ///
    /// # Errors
    /// `KwsError::Extraction` if the configured feature front end cannot be
    /// built.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let model = ModelHandle::new(InferenceEngine::new(config.arena_size));
        Self::with_model(config, model)
    }

    /// Engine backed by any `KeywordModel`.
    pub fn with_model(config: EngineConfig, model: ModelHandle) -> Result<Self> {
        let generator = build_generator(config.feature_strategy)?;
        let capacity = config.broadcast_capacity.max(1);
        let (classification_tx, _) = broadcast::channel(capacity);
        let (status_tx, _) = broadcast::channel(capacity);
        info!(
            arena_size = config.arena_size,
            features = generator.name(),
            "keyword engine created"
        );

        Ok(Self {
            config,
            model,
            ring: AudioRingHandle::default(),
            cycle: Mutex::new(CycleScratch {
                window: Box::new([0; AUDIO_CAPACITY]),
                features: FeatureMatrix::zeroed(),
                generator,
            }),
            state: Mutex::new(PipelineState::Uninitialized),
            classification_tx,
            status_tx,
            seq: AtomicU64::new(0),
            diagnostics: Arc::new(PipelineDiagnostics::default()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Bind `model` and zero the audio history.
    ///
    /// # Errors
    /// - `KwsError::AlreadyInitialized` when a model is already bound.
    /// - `KwsError::Init` when the model is rejected; the state is unchanged.
    pub fn initialize(&self, model: Model) -> Result<()> {
        let _cycle = self.cycle.lock();
        let current = self.state();
        if matches!(current, PipelineState::Ready | PipelineState::Classifying) {
            return Err(KwsError::AlreadyInitialized);
        }

        info!(model_bytes = model.len(), "initializing keyword pipeline");
        if let Err(e) = self.model.0.lock().initialize(model) {
            warn!(error = %e, "model rejected");
            self.set_status(current, Some(e.to_string()));
            return Err(e.into());
        }

        self.ring.reset();
        self.diagnostics.reset();
        self.set_status(PipelineState::Ready, None);
        info!("keyword pipeline ready");
        Ok(())
    }

    /// Producer entry point: store samples without classifying.
    pub fn append_audio(&self, samples: &[i16]) {
        self.ring.append(samples);
    }

    /// Append `samples` and run one cycle over the updated window.
    ///
    /// # Errors
    /// As [`classify`](Self::classify).
    /// A delivery to an engine that is not `Ready` is rejected before it
    /// reaches the ring.
    pub fn process_chunk(&self, samples: &[i16]) -> Result<Classification> {
        let mut scratch = self.cycle.lock();
        self.ensure_ready()?;
        self.ring.append(samples);
        self.classify_locked(&mut scratch)
    }

    /// Run one cycle over the current window.
    ///
    /// # Errors
    /// - `InvokeError::NotInitialized` unless the engine is `Ready`; the state
    ///   is left as it was.
    /// - Extraction and inference failures; the engine returns to `Ready`.
    pub fn classify(&self) -> Result<Classification> {
        let mut scratch = self.cycle.lock();
        self.ensure_ready()?;
        self.classify_locked(&mut scratch)
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.state() != PipelineState::Ready {
            return Err(InvokeError::NotInitialized.into());
        }
        Ok(())
    }

    /// Caller holds the cycle lock and has checked the state.
    fn classify_locked(&self, scratch: &mut CycleScratch) -> Result<Classification> {
        self.set_state(PipelineState::Classifying);
        let result = self.run_cycle(scratch);
        self.set_state(PipelineState::Ready);

        if let Err(e) = &result {
            warn!(error = %e, "classification cycle failed");
            self.set_status(PipelineState::Ready, Some(e.to_string()));
        }
        result
    }

    fn run_cycle(&self, scratch: &mut CycleScratch) -> Result<Classification> {
        let CycleScratch {
            window,
            features,
            generator,
        } = scratch;
        self.diagnostics.cycles.fetch_add(1, Ordering::Relaxed);

        self.ring.snapshot_into(window);

        if let Err(e) = generator.generate(window, features) {
            self.diagnostics
                .extraction_errors
                .fetch_add(1, Ordering::Relaxed);
            return Err(e.into());
        }

        let scores = match self.model.0.lock().invoke(features) {
            Ok(scores) => *scores,
            Err(e) => {
                self.diagnostics
                    .inference_errors
                    .fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        let classification = decode(&scores);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.diagnostics
            .classifications
            .fetch_add(1, Ordering::Relaxed);
        debug!(
            seq,
            command = %classification.command,
            confidence = classification.confidence,
            "classified"
        );
        let _ = self
            .classification_tx
            .send(ClassificationEvent::new(seq, classification));
        Ok(classification)
    }

    /// Release the model. Later cycles fail with `NotInitialized` until the
    /// engine is initialized again. Idempotent.
    pub fn shutdown(&self) {
        let _cycle = self.cycle.lock();
        if self.state() == PipelineState::ShutDown {
            return;
        }
        self.model.0.lock().shutdown();
        self.set_status(PipelineState::ShutDown, None);
        info!("keyword pipeline shut down");
    }

    /// Current state (snapshot).
    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    /// Subscribe to classification results.
    pub fn subscribe_classifications(&self) -> broadcast::Receiver<ClassificationEvent> {
        self.classification_tx.subscribe()
    }

    /// Subscribe to state changes and cycle failures.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status_tx.subscribe()
    }

    /// Samples appended since the last successful initialize.
    pub fn samples_received(&self) -> u64 {
        self.ring.total_written()
    }

    /// Snapshot of pipeline counters for observability.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    pub(crate) fn diagnostics(&self) -> &PipelineDiagnostics {
        &self.diagnostics
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn set_state(&self, state: PipelineState) {
        *self.state.lock() = state;
    }

    fn set_status(&self, state: PipelineState, detail: Option<String>) {
        self.set_state(state);
        let _ = self.status_tx.send(StatusEvent { state, detail });
    }
}

impl std::fmt::Debug for KwsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KwsEngine")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::broadcast::error::TryRecvError;

    use crate::constants::CATEGORY_COUNT;
    use crate::decoder::Command;
    use crate::error::InitError;
    use crate::inference::{reference_model, KeywordModel, ModelBuilder, ScoreVector};

    /// Returns fixed scores (or a fixed failure) and records the features it
    /// was shown.
    struct ScriptedModel {
        scores: ScoreVector,
        fail: bool,
        bound: bool,
        seen: Arc<Mutex<Vec<FeatureMatrix>>>,
    }

    impl ScriptedModel {
        fn new(scores: [i8; CATEGORY_COUNT]) -> (Self, Arc<Mutex<Vec<FeatureMatrix>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    scores: ScoreVector::new(scores),
                    fail: false,
                    bound: false,
                    seen: Arc::clone(&seen),
                },
                seen,
            )
        }
    }

    impl KeywordModel for ScriptedModel {
        fn initialize(&mut self, _model: Model) -> std::result::Result<(), InitError> {
            self.bound = true;
            Ok(())
        }

        fn invoke(
            &mut self,
            features: &FeatureMatrix,
        ) -> std::result::Result<&ScoreVector, InvokeError> {
            if !self.bound {
                return Err(InvokeError::NotInitialized);
            }
            self.seen.lock().push(features.clone());
            if self.fail {
                return Err(InvokeError::ExecutionFailed {
                    op_index: 3,
                    reason: "intentional test failure".into(),
                });
            }
            Ok(&self.scores)
        }

        fn shutdown(&mut self) {
            self.bound = false;
        }

        fn is_initialized(&self) -> bool {
            self.bound
        }
    }

    fn scripted_engine(scores: [i8; CATEGORY_COUNT]) -> (KwsEngine, Arc<Mutex<Vec<FeatureMatrix>>>) {
        let (model, seen) = ScriptedModel::new(scores);
        let engine = KwsEngine::with_model(EngineConfig::default(), ModelHandle::new(model)).unwrap();
        (engine, seen)
    }

    fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
        let mut out = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(ev) => out.push(ev),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty | TryRecvError::Closed) => return out,
            }
        }
    }

    #[test]
    fn classify_before_initialize_leaves_state_unchanged() {
        let engine = KwsEngine::new(EngineConfig::default()).unwrap();
        let mut events = engine.subscribe_classifications();

        let err = engine.classify().unwrap_err();
        assert!(matches!(err, KwsError::Invoke(InvokeError::NotInitialized)));
        assert_eq!(engine.state(), PipelineState::Uninitialized);

        let err = engine.process_chunk(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, KwsError::Invoke(InvokeError::NotInitialized)));
        assert_eq!(engine.state(), PipelineState::Uninitialized);
        assert_eq!(engine.samples_received(), 0);
        assert!(drain(&mut events).is_empty());
    }

    #[test]
    fn chunk_after_shutdown_is_not_stored() {
        let (engine, seen) = scripted_engine([0; 4]);
        engine.initialize(reference_model()).unwrap();
        engine.shutdown();

        let err = engine.process_chunk(&[9_000; 1_600]).unwrap_err();
        assert!(matches!(err, KwsError::Invoke(InvokeError::NotInitialized)));
        assert_eq!(engine.state(), PipelineState::ShutDown);
        assert_eq!(engine.samples_received(), 0);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn silence_decodes_to_silence_with_the_reference_model() {
        let engine = KwsEngine::new(EngineConfig::default()).unwrap();
        let mut status = engine.subscribe_status();
        let mut events = engine.subscribe_classifications();

        engine.initialize(reference_model()).unwrap();
        assert_eq!(engine.state(), PipelineState::Ready);
        let st = drain(&mut status);
        assert_eq!(st.len(), 1);
        assert_eq!(st[0].state, PipelineState::Ready);

        let c = engine.process_chunk(&[0; 1600]).unwrap();
        assert_eq!(c.command, Command::Silence);
        assert_eq!(c.confidence, 223);
        assert_eq!(engine.state(), PipelineState::Ready);

        let ev = drain(&mut events);
        assert_eq!(ev.len(), 1);
        assert_eq!(ev[0].seq, 0);
        assert_eq!(ev[0].label, "silence");
        assert_eq!(ev[0].confidence, 223);
    }

    #[test]
    fn second_initialize_is_rejected() {
        let (engine, _) = scripted_engine([0; 4]);
        engine.initialize(reference_model()).unwrap();
        assert!(matches!(
            engine.initialize(reference_model()),
            Err(KwsError::AlreadyInitialized)
        ));
        assert_eq!(engine.state(), PipelineState::Ready);
    }

    #[test]
    fn rejected_model_stays_uninitialized() {
        let engine = KwsEngine::new(EngineConfig::default()).unwrap();
        let mut status = engine.subscribe_status();
        let err = engine
            .initialize(ModelBuilder::new().schema_version(99).finish())
            .unwrap_err();
        assert!(matches!(
            err,
            KwsError::Init(InitError::SchemaMismatch { found: 99, .. })
        ));
        assert_eq!(engine.state(), PipelineState::Uninitialized);

        let st = drain(&mut status);
        assert_eq!(st[0].state, PipelineState::Uninitialized);
        assert!(st[0].detail.as_deref().unwrap_or("").contains("schema"));
        assert!(engine.classify().is_err());
    }

    #[test]
    fn ties_resolve_to_lower_index_through_the_engine() {
        let (engine, _) = scripted_engine([-3, 40, 40, 12]);
        engine.initialize(reference_model()).unwrap();
        let c = engine.classify().unwrap();
        assert_eq!(c.command, Command::Unknown);
        assert_eq!(c.confidence, 168);
    }

    #[test]
    fn chunks_reach_the_feature_matrix() {
        let (engine, seen) = scripted_engine([0; 4]);
        engine.initialize(reference_model()).unwrap();

        // Only the newest 0.5 s is loud; older slices stay silent.
        engine.process_chunk(&[3_000; 8_000]).unwrap();
        let seen = seen.lock();
        let features = seen.last().unwrap();
        assert_eq!(features.get(0, 0), 0);
        assert_eq!(features.get(48, 39), 127);
    }

    #[test]
    fn initialize_clears_audio_history() {
        let (engine, seen) = scripted_engine([0; 4]);
        engine.append_audio(&[3_000; 16_000]);
        engine.initialize(reference_model()).unwrap();
        engine.classify().unwrap();
        assert!(seen.lock()[0].as_slice().iter().all(|&v| v == 0));
        assert_eq!(engine.samples_received(), 0);
    }

    #[test]
    fn cycle_failure_returns_to_ready_and_is_counted() {
        let (mut model, _) = ScriptedModel::new([0; 4]);
        model.fail = true;
        let engine = KwsEngine::with_model(EngineConfig::default(), ModelHandle::new(model)).unwrap();
        engine.initialize(reference_model()).unwrap();
        let mut status = engine.subscribe_status();

        let err = engine.classify().unwrap_err();
        assert!(matches!(
            err,
            KwsError::Invoke(InvokeError::ExecutionFailed { op_index: 3, .. })
        ));
        assert!(err.is_recoverable());
        assert_eq!(engine.state(), PipelineState::Ready);

        let snap = engine.diagnostics_snapshot();
        assert_eq!(snap.cycles, 1);
        assert_eq!(snap.inference_errors, 1);
        assert_eq!(snap.classifications, 0);

        let st = drain(&mut status);
        assert_eq!(st.len(), 1);
        assert!(st[0].detail.is_some());
    }

    #[test]
    fn shutdown_then_reinitialize() {
        let engine = KwsEngine::new(EngineConfig::default()).unwrap();
        engine.initialize(reference_model()).unwrap();
        engine.shutdown();
        engine.shutdown();
        assert_eq!(engine.state(), PipelineState::ShutDown);
        assert!(matches!(
            engine.classify(),
            Err(KwsError::Invoke(InvokeError::NotInitialized))
        ));
        assert_eq!(engine.state(), PipelineState::ShutDown);

        engine.initialize(reference_model()).unwrap();
        assert_eq!(engine.classify().unwrap().command, Command::Silence);
    }

    #[test]
    fn sequence_numbers_increase() {
        let (engine, _) = scripted_engine([0; 4]);
        engine.initialize(reference_model()).unwrap();
        let mut events = engine.subscribe_classifications();
        for _ in 0..3 {
            engine.classify().unwrap();
        }
        let seqs: Vec<u64> = drain(&mut events).iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[cfg(not(feature = "spectral"))]
    #[test]
    fn spectral_strategy_needs_the_feature() {
        let config = EngineConfig {
            feature_strategy: FeatureStrategy::Spectral,
            ..EngineConfig::default()
        };
        assert!(matches!(KwsEngine::new(config), Err(KwsError::Extraction(_))));
    }
}
