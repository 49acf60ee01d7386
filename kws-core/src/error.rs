use thiserror::Error;

use crate::inference::model::OpCode;

/// Model load failures. All of them are terminal for the engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InitError {
    #[error("model schema version mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: u32, found: u32 },

    #[error("unsupported operator: {op:?}")]
    UnsupportedOperator { op: OpCode },

    #[error("tensor arena exhausted: plan needs {required} bytes, arena has {available}")]
    ArenaExhausted { required: usize, available: usize },

    #[error("{tensor} tensor shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        tensor: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("malformed model: {0}")]
    Malformed(String),
}

/// Per-cycle inference failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvokeError {
    #[error("inference engine is not initialized")]
    NotInitialized,

    #[error("forward pass failed at operator {op_index}: {reason}")]
    ExecutionFailed { op_index: usize, reason: String },
}

/// Per-cycle feature generation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    #[error("invalid feature generator config: {0}")]
    InvalidConfig(String),

    #[error("non-finite band energy in slice {slice}, band {band}")]
    NonFinite { slice: usize, band: usize },
}

/// All errors produced by kws-core.
#[derive(Debug, Error)]
pub enum KwsError {
    #[error("initialization failed: {0}")]
    Init(#[from] InitError),

    #[error("inference failed: {0}")]
    Invoke(#[from] InvokeError),

    #[error("feature extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("pipeline is already initialized")]
    AlreadyInitialized,

    #[error("audio resampler error: {0}")]
    Resampler(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KwsError {
    /// `true` for failures that only spoil the current cycle.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            KwsError::Extraction(_) | KwsError::Invoke(InvokeError::ExecutionFailed { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, KwsError>;
