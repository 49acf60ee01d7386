//! Audio window → quantized feature matrix.
//!
//! The `FeatureGenerator` trait is the extensibility point: the default
//! `EnergyFeatures` approximation, the mel-filterbank `SpectralFeatures`
//! (behind the `spectral` feature), or any future front end can be swapped in
//! without touching the pipeline. Every generator writes into a
//! caller-owned [`FeatureMatrix`], so a cycle never allocates.

pub mod energy;

#[cfg(feature = "spectral")]
pub mod spectral;

pub use energy::EnergyFeatures;

#[cfg(feature = "spectral")]
pub use spectral::{SpectralConfig, SpectralFeatures};

use serde::{Deserialize, Serialize};

use crate::constants::{AudioWindow, FEATURE_ELEMENT_COUNT, FEATURE_SLICE_SIZE};
use crate::error::ExtractionError;

/// `FEATURE_SLICE_COUNT × FEATURE_SLICE_SIZE` int8 features, row-major
/// (slice index outer, bin index inner).
#[derive(Clone, PartialEq, Eq)]
pub struct FeatureMatrix {
    data: [i8; FEATURE_ELEMENT_COUNT],
}

impl FeatureMatrix {
    pub fn zeroed() -> Self {
        Self {
            data: [0; FEATURE_ELEMENT_COUNT],
        }
    }

    pub fn get(&self, slice: usize, bin: usize) -> i8 {
        self.data[slice * FEATURE_SLICE_SIZE + bin]
    }

    pub fn set(&mut self, slice: usize, bin: usize, value: i8) {
        self.data[slice * FEATURE_SLICE_SIZE + bin] = value;
    }

    /// One time slice.
    pub fn row(&self, slice: usize) -> &[i8] {
        let start = slice * FEATURE_SLICE_SIZE;
        &self.data[start..start + FEATURE_SLICE_SIZE]
    }

    /// Flattened row-major view, the layout the model input expects.
    pub fn as_slice(&self) -> &[i8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [i8] {
        &mut self.data
    }
}

impl Default for FeatureMatrix {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl std::fmt::Debug for FeatureMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (min, max) = self
            .data
            .iter()
            .fold((i8::MAX, i8::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        f.debug_struct("FeatureMatrix")
            .field("min", &min)
            .field("max", &max)
            .finish_non_exhaustive()
    }
}

/// Which front end the engine builds at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureStrategy {
    /// Clamped sub-band energy. Approximate but cheap and never fails.
    #[default]
    Energy,
    /// Hann window + FFT + mel filterbank. Requires the `spectral` feature.
    Spectral,
}

/// Contract for feature front ends.
///
/// Implementations must be deterministic: the same window always produces a
/// bit-identical matrix.
pub trait FeatureGenerator: Send + 'static {
    /// Fill `out` from one full window of audio, oldest sample first.
    ///
    /// # Errors
    /// Only generators with internal numeric stages may fail.
    fn generate(&mut self, window: &AudioWindow, out: &mut FeatureMatrix)
        -> Result<(), ExtractionError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Build the generator for `strategy`.
///
/// # Errors
/// `ExtractionError::InvalidConfig` when `Spectral` is requested in a build
/// without the `spectral` feature.
pub fn build_generator(
    strategy: FeatureStrategy,
) -> Result<Box<dyn FeatureGenerator>, ExtractionError> {
    match strategy {
        FeatureStrategy::Energy => Ok(Box::new(EnergyFeatures::new())),
        #[cfg(feature = "spectral")]
        FeatureStrategy::Spectral => Ok(Box::new(SpectralFeatures::new(
            SpectralConfig::default(),
        )?)),
        #[cfg(not(feature = "spectral"))]
        FeatureStrategy::Spectral => Err(ExtractionError::InvalidConfig(
            "compiled without the spectral feature".into(),
        )),
    }
}

/// Extract features with the reference energy front end.
pub fn extract(window: &AudioWindow) -> FeatureMatrix {
    let mut out = FeatureMatrix::zeroed();
    energy::fill(window, &mut out);
    out
}
