//! Typed audio chunk handed from the audio producer to the pipeline.

use crate::constants::SAMPLE_RATE;

/// A contiguous block of mono 16-bit PCM samples at a known sample rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub samples: Vec<i16>,
    /// Sample rate in Hz. The pipeline only accepts [`SAMPLE_RATE`].
    pub sample_rate: u32,
}

impl AudioChunk {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Chunk at the pipeline's native rate.
    pub fn native(samples: Vec<i16>) -> Self {
        Self::new(samples, SAMPLE_RATE)
    }

    /// Decode little-endian PCM bytes as delivered by byte-oriented capture
    /// drivers. A trailing odd byte is not a whole sample and is ignored.
    pub fn from_pcm_le_bytes(bytes: &[u8], sample_rate: u32) -> Self {
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Self::new(samples, sample_rate)
    }

    /// Returns the duration of this chunk in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
