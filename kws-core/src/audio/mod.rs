//! Audio format helpers for producers feeding the pipeline.
//!
//! The pipeline itself only accepts 16 kHz mono i16 PCM. Producers that
//! capture at another rate convert with [`resample::RateConverter`] before
//! sending chunks; this keeps the classification thread free of DSP state.

pub mod resample;

pub use resample::RateConverter;

/// i16 PCM → f32 in `[-1, 1)`.
pub fn pcm_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32_768.0
}

/// f32 → i16 PCM, rounded and saturated.
pub fn f32_to_pcm(sample: f32) -> i16 {
    (sample * 32_768.0)
        .round()
        .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}

/// Average interleaved frames down to one channel.
pub fn downmix_to_mono(interleaved: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_saturate() {
        assert_eq!(f32_to_pcm(1.5), i16::MAX);
        assert_eq!(f32_to_pcm(-1.5), i16::MIN);
        assert_eq!(f32_to_pcm(pcm_to_f32(-1234)), -1234);
        assert_eq!(pcm_to_f32(i16::MIN), -1.0);
    }

    #[test]
    fn downmix_averages_frames() {
        assert_eq!(downmix_to_mono(&[100, 300, -50, 50, 7], 2), vec![200, 0]);
        assert_eq!(downmix_to_mono(&[1, 2, 3], 1), vec![1, 2, 3]);
    }
}
