//! Fixed pipeline dimensions shared by every stage.
//!
//! These are compile-time constants, not runtime settings: the model artifact
//! is built against exactly this window and feature shape.

/// Input sample rate in Hz.
pub const SAMPLE_RATE: u32 = 16_000;

/// Audio history kept for one classification window (1 s).
pub const AUDIO_WINDOW_MS: u32 = 1_000;

/// Ring buffer capacity in samples.
pub const AUDIO_CAPACITY: usize = (SAMPLE_RATE * AUDIO_WINDOW_MS / 1_000) as usize;

/// Spectral bins per feature slice (matrix columns).
pub const FEATURE_SLICE_SIZE: usize = 40;

/// Time slices per window (matrix rows).
pub const FEATURE_SLICE_COUNT: usize = 49;

/// Flattened feature length, which is also the model's input length.
pub const FEATURE_ELEMENT_COUNT: usize = FEATURE_SLICE_SIZE * FEATURE_SLICE_COUNT;

/// Number of command classes the model scores.
pub const CATEGORY_COUNT: usize = 4;

pub const SILENCE_INDEX: usize = 0;
pub const UNKNOWN_INDEX: usize = 1;

/// Default inference arena: 10 KiB.
pub const TENSOR_ARENA_SIZE: usize = 10 * 1024;

/// Model schema version this runtime was built against.
pub const SCHEMA_VERSION: u32 = 3;

/// One full window of PCM samples, oldest first.
pub type AudioWindow = [i16; AUDIO_CAPACITY];
