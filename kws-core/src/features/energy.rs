//! Clamped sub-band energy features.
//!
//! ## Algorithm
//!
//! 1. Split the window into `FEATURE_SLICE_COUNT` slices of
//!    `AUDIO_CAPACITY / FEATURE_SLICE_COUNT` samples (326; the last 26
//!    samples of the window fall outside every slice).
//! 2. Split each slice into `FEATURE_SLICE_SIZE` bands of
//!    `samples_per_slice / FEATURE_SLICE_SIZE` samples (8; the last 6
//!    samples of a slice are unused).
//! 3. Per band: `Σ (s² / 1024)` with integer division per sample, divided by
//!    `band_size + 1`, clamped to `[-128, 127]`.
//!
//! This is a time-domain approximation of a spectral front end. Energy is
//! never negative, so silence maps to 0 and loud bands saturate at 127.

use super::{FeatureGenerator, FeatureMatrix};
use crate::constants::{AudioWindow, AUDIO_CAPACITY, FEATURE_SLICE_COUNT, FEATURE_SLICE_SIZE};
use crate::error::ExtractionError;

pub const SAMPLES_PER_SLICE: usize = AUDIO_CAPACITY / FEATURE_SLICE_COUNT;
pub const BAND_SIZE: usize = SAMPLES_PER_SLICE / FEATURE_SLICE_SIZE;

/// Per-sample normalisation divisor applied to `s²`.
const SQUARE_DIVISOR: i32 = 1024;

/// Stateless energy front end.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnergyFeatures;

impl EnergyFeatures {
    pub fn new() -> Self {
        Self
    }
}

impl FeatureGenerator for EnergyFeatures {
    fn generate(
        &mut self,
        window: &AudioWindow,
        out: &mut FeatureMatrix,
    ) -> Result<(), ExtractionError> {
        fill(window, out);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "energy"
    }
}

/// Quantized energy of one band.
fn band_energy(band: &[i16]) -> i8 {
    let mut energy: i32 = 0;
    for &s in band {
        let s = i32::from(s);
        energy += (s * s) / SQUARE_DIVISOR;
    }
    (energy / (BAND_SIZE as i32 + 1)).clamp(i8::MIN as i32, i8::MAX as i32) as i8
}

pub(crate) fn fill(window: &AudioWindow, out: &mut FeatureMatrix) {
    for slice in 0..FEATURE_SLICE_COUNT {
        let slice_start = slice * SAMPLES_PER_SLICE;
        let samples = &window[slice_start..slice_start + SAMPLES_PER_SLICE];
        for bin in 0..FEATURE_SLICE_SIZE {
            let band_start = bin * BAND_SIZE;
            out.set(slice, bin, band_energy(&samples[band_start..band_start + BAND_SIZE]));
        }
    }
}
