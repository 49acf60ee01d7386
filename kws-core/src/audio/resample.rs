//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! WAV files and capture devices commonly run at 44.1 or 48 kHz while the
//! model window is defined at 16 kHz. `RateConverter` bridges that gap on the
//! producer side, where allocation is allowed.
//!
//! When input rate == target rate no rubato session is created and samples
//! pass straight through.
//!
//! ```ignore
//! let mut rc = RateConverter::new(48_000, 16_000, 960)?;
//! let out = rc.process(&raw_samples)?; // Vec<i16> at 16 kHz
//! let tail = rc.flush()?;
//! ```

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::info;

use super::{f32_to_pcm, pcm_to_f32};
use crate::error::{KwsError, Result};

/// Converts i16 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when input rate == target rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    /// Holds partial input chunks between calls.
    input_buf: Vec<f32>,
    /// Input frames rubato expects per process call.
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// # Errors
    /// `KwsError::Resampler` if rubato rejects the parameters.
    pub fn new(input_rate: u32, target_rate: u32, chunk_size: usize) -> Result<Self> {
        if input_rate == target_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
            });
        }
        if input_rate == 0 || target_rate == 0 || chunk_size == 0 {
            return Err(KwsError::Resampler(format!(
                "invalid conversion {input_rate} Hz → {target_rate} Hz, chunk {chunk_size}"
            )));
        }

        let ratio = f64::from(target_rate) / f64::from(input_rate);
        let resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, chunk_size, 1)
            .map_err(|e| KwsError::Resampler(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        info!(input_rate, target_rate, chunk_size, max_out, "resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::with_capacity(chunk_size * 2),
            chunk_size,
            output_buf: vec![vec![0f32; max_out]; 1],
        })
    }

    /// Convert `samples`, returning whatever output is ready (may be empty).
    /// Input short of a full chunk is kept for the next call.
    ///
    /// # Errors
    /// `KwsError::Resampler` if rubato fails mid-stream.
    pub fn process(&mut self, samples: &[i16]) -> Result<Vec<i16>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(samples.to_vec());
        };

        self.input_buf.extend(samples.iter().map(|&s| pcm_to_f32(s)));

        let mut result = Vec::new();
        let mut consumed_total = 0;
        while self.input_buf.len() - consumed_total >= self.chunk_size {
            let input = &self.input_buf[consumed_total..consumed_total + self.chunk_size];
            let (consumed, produced) = resampler
                .process_into_buffer(&[input], &mut self.output_buf, None)
                .map_err(|e| KwsError::Resampler(e.to_string()))?;
            result.extend(self.output_buf[0][..produced].iter().map(|&s| f32_to_pcm(s)));
            consumed_total += consumed;
        }
        self.input_buf.drain(..consumed_total);
        Ok(result)
    }

    /// Push out buffered input at end of stream, zero-padding the last chunk.
    ///
    /// # Errors
    /// `KwsError::Resampler` if rubato fails.
    pub fn flush(&mut self) -> Result<Vec<i16>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(Vec::new());
        };
        if self.input_buf.is_empty() {
            return Ok(Vec::new());
        }

        let pending = self.input_buf.len();
        let wave_in: &[&[f32]] = &[&self.input_buf[..]];
        let (_, produced) = resampler
            .process_partial_into_buffer(Some(wave_in), &mut self.output_buf, None)
            .map_err(|e| KwsError::Resampler(e.to_string()))?;
        self.input_buf.clear();

        // Only the share of output backed by real input is kept.
        let ratio = resampler.output_frames_next() as f64 / self.chunk_size as f64;
        let keep = ((pending as f64 * ratio).round() as usize).min(produced);
        Ok(self.output_buf[0][..keep].iter().map(|&s| f32_to_pcm(s)).collect())
    }

    /// Returns `true` when input rate == target rate.
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}
