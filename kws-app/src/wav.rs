//! WAV input: decode, downmix and bring to the pipeline rate.

use std::path::Path;

use anyhow::{bail, Context};
use kws_core::audio::{downmix_to_mono, f32_to_pcm, RateConverter};
use kws_core::constants::SAMPLE_RATE;

/// Samples per rubato call when the file is not at 16 kHz.
const RESAMPLE_CHUNK: usize = 1_024;

/// Mono i16 PCM at the file's own rate.
pub fn read_mono(path: &Path) -> anyhow::Result<(Vec<i16>, u32)> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("opening {}", path.display()))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<i16> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map(f32_to_pcm))
            .collect::<Result<_, _>>()?,
        hound::SampleFormat::Int if spec.bits_per_sample <= 8 => reader
            .samples::<i8>()
            .map(|s| s.map(|v| i16::from(v) << 8))
            .collect::<Result<_, _>>()?,
        hound::SampleFormat::Int if spec.bits_per_sample <= 16 => {
            reader.samples::<i16>().collect::<Result<_, _>>()?
        }
        hound::SampleFormat::Int if spec.bits_per_sample <= 32 => {
            let shift = spec.bits_per_sample - 16;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| (v >> shift) as i16))
                .collect::<Result<_, _>>()?
        }
        hound::SampleFormat::Int => bail!("unsupported bit depth {}", spec.bits_per_sample),
    };

    Ok((downmix_to_mono(&interleaved, channels), spec.sample_rate))
}

/// Mono i16 PCM at 16 kHz.
pub fn read_for_pipeline(path: &Path) -> anyhow::Result<Vec<i16>> {
    let (samples, rate) = read_mono(path)?;
    if rate == SAMPLE_RATE {
        return Ok(samples);
    }

    tracing::info!(from = rate, to = SAMPLE_RATE, "resampling WAV input");
    let mut rc = RateConverter::new(rate, SAMPLE_RATE, RESAMPLE_CHUNK)?;
    let mut out = rc.process(&samples)?;
    out.extend(rc.flush()?);
    Ok(out)
}
