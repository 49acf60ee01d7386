//! Static-memory int8 inference.
//!
//! The `KeywordModel` trait decouples the controller from the interpreter so
//! tests (or a future accelerator backend) can stand in for it. The shipped
//! implementation, [`InferenceEngine`], binds a `KWSM` artifact to a fixed
//! arena once and then runs forward passes without touching the heap.
//!
//! `&mut self` on `invoke` reflects that a pass overwrites the arena; all
//! access is serialised through `ModelHandle`'s `parking_lot::Mutex`.

pub mod builder;
pub mod kernels;
pub mod model;
pub mod planner;
pub mod resolver;

pub use builder::{reference_model, ModelBuilder};
pub use model::{Model, OpCode};
pub use resolver::OpResolver;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::constants::{CATEGORY_COUNT, FEATURE_ELEMENT_COUNT, SCHEMA_VERSION};
use crate::error::{InitError, InvokeError};
use crate::features::FeatureMatrix;
use model::Graph;
use planner::ArenaPlan;
use resolver::{EvalFn, KernelContext};

/// Raw int8 class scores, indexed by `Command` discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScoreVector([i8; CATEGORY_COUNT]);

impl ScoreVector {
    pub const fn new(scores: [i8; CATEGORY_COUNT]) -> Self {
        Self(scores)
    }

    pub fn as_slice(&self) -> &[i8] {
        &self.0
    }
}

/// Contract for keyword classification backends.
pub trait KeywordModel: Send + 'static {
    /// Bind a model artifact. Replaces any previously bound model.
    ///
    /// # Errors
    /// Any `InitError`; the backend is left uninitialized.
    fn initialize(&mut self, model: Model) -> Result<(), InitError>;

    /// Run one forward pass over `features`.
    ///
    /// # Errors
    /// `NotInitialized` before a successful `initialize`,
    /// `ExecutionFailed` when a kernel faults.
    fn invoke(&mut self, features: &FeatureMatrix) -> Result<&ScoreVector, InvokeError>;

    /// Release the bound model. Idempotent.
    fn shutdown(&mut self);

    fn is_initialized(&self) -> bool;
}

/// Thread-safe reference-counted handle to any `KeywordModel` implementor.
#[derive(Clone)]
pub struct ModelHandle(pub Arc<Mutex<dyn KeywordModel>>);

impl ModelHandle {
    pub fn new<M: KeywordModel>(model: M) -> Self {
        Self(Arc::new(Mutex::new(model)))
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle").finish_non_exhaustive()
    }
}

/// State that exists only while a model is bound.
struct Bound {
    model: Model,
    graph: Graph,
    kernels: Vec<EvalFn>,
    plan: ArenaPlan,
    scores: ScoreVector,
}

/// Arena-backed interpreter for the four micro-speech operators.
pub struct InferenceEngine {
    arena: Box<[i8]>,
    resolver: OpResolver,
    bound: Option<Bound>,
}

impl InferenceEngine {
    /// Engine with an `arena_size`-byte arena and the builtin kernels.
    /// The arena is allocated here and never resized.
    pub fn new(arena_size: usize) -> Self {
        Self::with_resolver(arena_size, OpResolver::micro_speech())
    }

    pub fn with_resolver(arena_size: usize, resolver: OpResolver) -> Self {
        Self {
            arena: vec![0i8; arena_size].into_boxed_slice(),
            resolver,
            bound: None,
        }
    }

    pub fn arena_size(&self) -> usize {
        self.arena.len()
    }

    /// Bytes of the arena claimed by the current plan; 0 when unbound.
    pub fn arena_used(&self) -> usize {
        self.bound.as_ref().map_or(0, |b| b.plan.required)
    }

    fn bind(&self, model: Model) -> Result<Bound, InitError> {
        let graph = Graph::parse(model.as_bytes(), SCHEMA_VERSION)?;

        let mut regs = Vec::with_capacity(graph.operators.len());
        for op in &graph.operators {
            let reg = self
                .resolver
                .find(op.opcode)
                .ok_or(InitError::UnsupportedOperator { op: op.opcode })?;
            regs.push(*reg);
        }

        check_shape(&graph, graph.input, "input", &[1, FEATURE_ELEMENT_COUNT])?;
        check_shape(&graph, graph.output, "output", &[1, CATEGORY_COUNT])?;

        let plan = planner::plan(&graph)?;
        if plan.required > self.arena.len() {
            return Err(InitError::ArenaExhausted {
                required: plan.required,
                available: self.arena.len(),
            });
        }

        for (i, (op, reg)) in graph.operators.iter().zip(&regs).enumerate() {
            (reg.prepare)(&graph, op).map_err(|reason| {
                InitError::Malformed(format!("operator {i} ({:?}): {reason}", op.opcode))
            })?;
        }

        Ok(Bound {
            model,
            graph,
            kernels: regs.iter().map(|r| r.eval).collect(),
            plan,
            scores: ScoreVector::default(),
        })
    }
}

fn check_shape(
    graph: &Graph,
    tensor: usize,
    name: &'static str,
    expected: &[usize],
) -> Result<(), InitError> {
    let found = &graph.tensor(tensor).dims;
    if found[..] != *expected {
        return Err(InitError::ShapeMismatch {
            tensor: name,
            expected: expected.to_vec(),
            found: found.clone(),
        });
    }
    Ok(())
}

impl KeywordModel for InferenceEngine {
    fn initialize(&mut self, model: Model) -> Result<(), InitError> {
        self.bound = None;
        let bound = self.bind(model)?;
        info!(
            schema = SCHEMA_VERSION,
            operators = bound.graph.operators.len(),
            tensors = bound.graph.tensors.len(),
            model_bytes = bound.model.len(),
            arena_used = bound.plan.required,
            arena_size = self.arena.len(),
            "Model bound to arena"
        );
        self.bound = Some(bound);
        Ok(())
    }

    fn invoke(&mut self, features: &FeatureMatrix) -> Result<&ScoreVector, InvokeError> {
        let bound = self.bound.as_mut().ok_or(InvokeError::NotInitialized)?;
        let graph = &bound.graph;
        let plan = &bound.plan;

        let in_range = plan
            .range(graph.input)
            .ok_or_else(|| InvokeError::ExecutionFailed {
                op_index: 0,
                reason: "input tensor has no arena storage".into(),
            })?;
        self.arena[in_range].copy_from_slice(features.as_slice());

        for (i, (op, eval)) in graph.operators.iter().zip(&bound.kernels).enumerate() {
            let mut ctx = KernelContext {
                graph,
                model: bound.model.as_bytes(),
                arena: &mut self.arena,
                plan,
            };
            eval(&mut ctx, op).map_err(|reason| InvokeError::ExecutionFailed {
                op_index: i,
                reason,
            })?;
        }

        let out_range = plan
            .range(graph.output)
            .ok_or_else(|| InvokeError::ExecutionFailed {
                op_index: graph.operators.len(),
                reason: "output tensor has no arena storage".into(),
            })?;
        let mut scores = [0i8; CATEGORY_COUNT];
        scores.copy_from_slice(&self.arena[out_range]);
        bound.scores = ScoreVector(scores);
        debug!(scores = ?scores, "Forward pass complete");
        Ok(&bound.scores)
    }

    fn shutdown(&mut self) {
        if self.bound.take().is_some() {
            info!("Model released");
        }
    }

    fn is_initialized(&self) -> bool {
        self.bound.is_some()
    }
}

impl std::fmt::Debug for InferenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceEngine")
            .field("arena_size", &self.arena.len())
            .field("arena_used", &self.arena_used())
            .field("initialized", &self.bound.is_some())
            .finish()
    }
}
