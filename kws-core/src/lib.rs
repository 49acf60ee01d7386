//! # kws-core
//!
//! On-device keyword spotting: 1 s of 16 kHz audio in, one of
//! `silence | unknown | yes | no` out.
//!
//! ## Architecture
//!
//! ```text
//! Producer → AudioChunk ─► crossbeam channel ─► pipeline::run (spawn_blocking)
//!                                                   │
//!                                        AudioRing (16 000 × i16)
//!                                                   │ snapshot
//!                                     FeatureGenerator → 49 × 40 int8
//!                                                   │
//!                                  InferenceEngine (fixed arena, 4 ops)
//!                                                   │ scores
//!                                          decoder::decode (argmax)
//!                                                   │
//!                                 broadcast::Sender<ClassificationEvent>
//! ```
//!
//! Nothing on the cycle path allocates: the window, feature matrix, arena and
//! score vector are sized once and overwritten in place.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod constants;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod features;
pub mod inference;
pub mod ipc;

// Convenience re-exports for downstream crates
pub use buffering::{chunk::AudioChunk, AudioRing, AudioRingHandle};
pub use decoder::{command_to_string, decode, Classification, Command};
pub use engine::{EngineConfig, KwsEngine};
pub use error::{ExtractionError, InitError, InvokeError, KwsError, Result};
pub use features::{FeatureGenerator, FeatureMatrix, FeatureStrategy};
pub use inference::{InferenceEngine, KeywordModel, Model, ModelHandle, ScoreVector};
pub use ipc::events::{ClassificationEvent, PipelineState, StatusEvent};
