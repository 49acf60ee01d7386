//! Mel-filterbank features (`spectral` feature).
//!
//! Per time slice: Hann window over the slice's samples, zero-padded FFT,
//! power spectrum pooled through triangular mel filters, `ln(1 + energy)`
//! compression and an affine map onto int8. Produces the same matrix shape
//! as the energy front end, so the pipeline and model contract are unchanged.
//!
//! All tables and FFT scratch are built once in `new`; `generate` does not
//! allocate.

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use super::energy::SAMPLES_PER_SLICE;
use super::{FeatureGenerator, FeatureMatrix};
use crate::constants::{AudioWindow, FEATURE_SLICE_COUNT, FEATURE_SLICE_SIZE, SAMPLE_RATE};
use crate::error::ExtractionError;

/// Front-end tuning. Defaults follow the usual micro-speech front end band
/// edges (125 Hz – 7.5 kHz).
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralConfig {
    /// FFT length; power of two, at least one slice long.
    pub fft_size: usize,
    pub lower_hz: f32,
    pub upper_hz: f32,
    /// Quantization step: int8 units per natural-log unit of band energy.
    pub log_scale: f32,
}

impl Default for SpectralConfig {
    fn default() -> Self {
        Self {
            fft_size: 512,
            lower_hz: 125.0,
            upper_hz: 7_500.0,
            log_scale: 8.0,
        }
    }
}

impl SpectralConfig {
    fn validate(&self) -> Result<(), ExtractionError> {
        if !self.fft_size.is_power_of_two() || self.fft_size < SAMPLES_PER_SLICE {
            return Err(ExtractionError::InvalidConfig(format!(
                "fft_size {} must be a power of two >= {}",
                self.fft_size, SAMPLES_PER_SLICE
            )));
        }
        let nyquist = SAMPLE_RATE as f32 / 2.0;
        if !(self.lower_hz >= 0.0 && self.lower_hz < self.upper_hz && self.upper_hz <= nyquist) {
            return Err(ExtractionError::InvalidConfig(format!(
                "band edges {}..{} Hz outside 0..{} Hz",
                self.lower_hz, self.upper_hz, nyquist
            )));
        }
        if !(self.log_scale.is_finite() && self.log_scale > 0.0) {
            return Err(ExtractionError::InvalidConfig(format!(
                "log_scale {} must be positive",
                self.log_scale
            )));
        }
        Ok(())
    }
}

pub struct SpectralFeatures {
    config: SpectralConfig,
    fft: Arc<dyn Fft<f32>>,
    hann_window: Vec<f32>,
    /// `[FEATURE_SLICE_SIZE][fft_size / 2 + 1]`
    mel_filters: Vec<Vec<f32>>,
    fft_buf: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl SpectralFeatures {
    /// # Errors
    /// `ExtractionError::InvalidConfig` if `config` cannot produce a valid
    /// filterbank.
    pub fn new(config: SpectralConfig) -> Result<Self, ExtractionError> {
        config.validate()?;
        let fft = FftPlanner::<f32>::new().plan_fft_forward(config.fft_size);
        let scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];
        let mel_filters = build_mel_filters(
            config.fft_size,
            SAMPLE_RATE,
            FEATURE_SLICE_SIZE,
            config.lower_hz,
            config.upper_hz,
        );

        Ok(Self {
            hann_window: build_hann_window(SAMPLES_PER_SLICE),
            fft_buf: vec![Complex::new(0.0, 0.0); config.fft_size],
            scratch,
            mel_filters,
            fft,
            config,
        })
    }

    fn quantize(&self, energy: f32) -> i8 {
        let q = (energy.ln_1p() * self.config.log_scale).round() - 128.0;
        q.clamp(i8::MIN as f32, i8::MAX as f32) as i8
    }
}

impl FeatureGenerator for SpectralFeatures {
    fn generate(
        &mut self,
        window: &AudioWindow,
        out: &mut FeatureMatrix,
    ) -> Result<(), ExtractionError> {
        let n_freqs = self.config.fft_size / 2 + 1;

        for slice in 0..FEATURE_SLICE_COUNT {
            let start = slice * SAMPLES_PER_SLICE;
            let samples = &window[start..start + SAMPLES_PER_SLICE];

            for v in self.fft_buf.iter_mut() {
                *v = Complex::new(0.0, 0.0);
            }
            for (i, &s) in samples.iter().enumerate() {
                let x = f32::from(s) / 32_768.0;
                self.fft_buf[i] = Complex::new(x * self.hann_window[i], 0.0);
            }
            self.fft
                .process_with_scratch(&mut self.fft_buf, &mut self.scratch);

            for band in 0..FEATURE_SLICE_SIZE {
                let filter = &self.mel_filters[band];
                let mut energy = 0.0f32;
                for k in 0..n_freqs {
                    energy += filter[k] * self.fft_buf[k].norm_sqr();
                }
                if !energy.is_finite() {
                    return Err(ExtractionError::NonFinite { slice, band });
                }
                // Scale back into the PCM power range so quiet speech still
                // spans several quantization steps.
                out.set(slice, band, self.quantize(energy * 32_768.0));
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "spectral"
    }
}

fn build_hann_window(n: usize) -> Vec<f32> {
    use std::f32::consts::PI;
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / n as f32).cos()))
        .collect()
}

fn hz_to_mel(hz: f32) -> f32 {
    1127.0 * (1.0 + hz / 700.0).ln()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * ((mel / 1127.0).exp() - 1.0)
}

/// Triangular filters evenly spaced on the HTK mel scale.
fn build_mel_filters(
    fft_size: usize,
    sr: u32,
    n_mels: usize,
    fmin: f32,
    fmax: f32,
) -> Vec<Vec<f32>> {
    let n_freqs = fft_size / 2 + 1;
    let mel_min = hz_to_mel(fmin);
    let mel_max = hz_to_mel(fmax);

    let hz_pts: Vec<f32> = (0..=(n_mels + 1))
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32))
        .collect();

    let mut filters = vec![vec![0f32; n_freqs]; n_mels];
    for (m, filter) in filters.iter_mut().enumerate() {
        let lower = hz_pts[m];
        let center = hz_pts[m + 1];
        let upper = hz_pts[m + 2];
        let down = (center - lower).max(1e-10);
        let up = (upper - center).max(1e-10);

        for (k, w) in filter.iter_mut().enumerate() {
            let freq = k as f32 * sr as f32 / fft_size as f32;
            *w = if freq >= lower && freq <= center {
                (freq - lower) / down
            } else if freq > center && freq <= upper {
                (upper - freq) / up
            } else {
                0.0
            };
        }
    }
    filters
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    use crate::constants::AUDIO_CAPACITY;

    fn tone(freq_hz: f32, amplitude: f32) -> Box<AudioWindow> {
        let mut w = Box::new([0i16; AUDIO_CAPACITY]);
        for (i, s) in w.iter_mut().enumerate() {
            let t = i as f32 / SAMPLE_RATE as f32;
            *s = (amplitude * (2.0 * std::f32::consts::PI * freq_hz * t).sin()) as i16;
        }
        w
    }

    #[test]
    fn rejects_short_fft() {
        let cfg = SpectralConfig {
            fft_size: 256,
            ..SpectralConfig::default()
        };
        assert!(matches!(
            SpectralFeatures::new(cfg),
            Err(ExtractionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_band_above_nyquist() {
        let cfg = SpectralConfig {
            upper_hz: 9_000.0,
            ..SpectralConfig::default()
        };
        assert!(SpectralFeatures::new(cfg).is_err());
    }

    #[test]
    fn silence_maps_to_floor() {
        let mut gen = SpectralFeatures::new(SpectralConfig::default()).unwrap();
        let mut out = FeatureMatrix::zeroed();
        gen.generate(&Box::new([0i16; AUDIO_CAPACITY]), &mut out)
            .unwrap();
        assert!(out.as_slice().iter().all(|&v| v == -128));
    }

    #[test]
    fn tone_peaks_in_matching_band() {
        let mut gen = SpectralFeatures::new(SpectralConfig::default()).unwrap();
        let mut out = FeatureMatrix::zeroed();
        gen.generate(&tone(1_000.0, 8_000.0), &mut out).unwrap();

        let row = out.row(20);
        let peak = row
            .iter()
            .enumerate()
            .max_by_key(|&(_, v)| *v)
            .map(|(i, _)| i)
            .unwrap();
        let centre_hz = mel_to_hz(
            hz_to_mel(125.0)
                + (hz_to_mel(7_500.0) - hz_to_mel(125.0)) * (peak + 1) as f32
                    / (FEATURE_SLICE_SIZE + 1) as f32,
        );
        assert!(
            (centre_hz - 1_000.0).abs() < 250.0,
            "peak band {peak} centred at {centre_hz} Hz"
        );
    }

    #[test]
    fn deterministic_across_calls() {
        let mut gen = SpectralFeatures::new(SpectralConfig::default()).unwrap();
        let window = tone(440.0, 5_000.0);
        let mut a = FeatureMatrix::zeroed();
        let mut b = FeatureMatrix::zeroed();
        gen.generate(&window, &mut a).unwrap();
        gen.generate(&window, &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn mel_scale_round_trips() {
        for hz in [125.0f32, 1_000.0, 4_000.0, 7_500.0] {
            assert_relative_eq!(mel_to_hz(hz_to_mel(hz)), hz, max_relative = 1e-4);
        }
    }
}
