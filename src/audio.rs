//! Audio I/O and basic processing functionality

use crate::error::{PipelineError, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::ops::Range;
use std::path::Path;
use tracing::{debug, warn};

/// Mono PCM audio with its sample rate
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    /// Samples normalized to [-1, 1]
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Get audio duration in seconds
    pub fn duration_s(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn peak(&self) -> f32 {
        peak(&self.samples)
    }
}

/// Load audio file and return a mono buffer
pub fn load_audio_file<P: AsRef<Path>>(path: P) -> Result<AudioBuffer> {
    let path = path.as_ref();

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("")
        .to_lowercase();

    match extension.as_str() {
        "wav" | "wave" => load_wav_file(path),
        _ => Err(PipelineError::InvalidInput(format!(
            "Unsupported audio format: {}",
            extension
        ))),
    }
}

/// Load WAV file, mixing all channels down to mono
fn load_wav_file<P: AsRef<Path>>(path: P) -> Result<AudioBuffer> {
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();

    if spec.channels == 0 {
        return Err(PipelineError::AudioFile("WAV header reports zero channels".to_string()));
    }

    if spec.bits_per_sample > 32 {
        return Err(PipelineError::AudioFile(format!(
            "Unsupported bit depth: {}",
            spec.bits_per_sample
        )));
    }

    let mut interleaved: Vec<f32> = Vec::with_capacity(reader.len() as usize);

    match spec.sample_format {
        SampleFormat::Int => {
            let max_value = (1i64 << (spec.bits_per_sample - 1)) as f32;
            for sample in reader.samples::<i32>() {
                interleaved.push(sample? as f32 / max_value);
            }
        }
        SampleFormat::Float => {
            for sample in reader.samples::<f32>() {
                interleaved.push(sample?);
            }
        }
    }

    let channels = spec.channels as usize;
    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };

    Ok(AudioBuffer::new(samples, spec.sample_rate))
}

/// Write mono samples as a 32-bit float WAV file
pub fn write_wav<P: AsRef<Path>>(path: P, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(path, spec)?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Validate audio file format and content
pub fn validate_audio_file<P: AsRef<Path>>(path: P) -> Result<AudioBuffer> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(PipelineError::InvalidInput(format!(
            "Audio file does not exist: {}",
            path.display()
        )));
    }

    let audio = load_audio_file(path)?;

    if audio.is_empty() {
        return Err(PipelineError::InvalidInput(
            "Audio file contains no samples".to_string(),
        ));
    }

    if !(8000..=192000).contains(&audio.sample_rate) {
        return Err(PipelineError::InvalidInput(format!(
            "Unsupported sample rate {} Hz",
            audio.sample_rate
        )));
    }

    let peak = audio.peak();
    if peak > 0.99 {
        warn!(peak, "audio file may be clipped");
    }

    Ok(audio)
}

pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |m, &x| m.max(x.abs()))
}

/// Scale so the absolute peak equals `target`. Silent input is returned unchanged.
pub fn peak_normalize(samples: &[f32], target: f32) -> Vec<f32> {
    let p = peak(samples);
    if p <= f32::EPSILON {
        return samples.to_vec();
    }
    let gain = target / p;
    samples.iter().map(|&x| x * gain).collect()
}

/// Range of samples whose magnitude is within `top_db` of the peak
pub fn trim_silence(samples: &[f32], top_db: f32) -> Range<usize> {
    let threshold = peak(samples) * 10f32.powf(-top_db / 20.0);
    let audible = |x: &f32| x.abs() >= threshold && *x != 0.0;
    match samples.iter().position(audible) {
        Some(start) => {
            let end = samples.iter().rposition(audible).map_or(start, |i| i + 1);
            start..end
        }
        None => 0..0,
    }
}

/// Resample mono audio with a windowed-sinc interpolator.
///
/// The output is aligned with the input (resampler delay removed) and has
/// `round(len * to / from)` samples.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let params = SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    };
    let ratio = to_rate as f64 / from_rate as f64;
    let chunk_size = 1024;

    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, chunk_size, 1)
        .map_err(|e| PipelineError::Resample(e.to_string()))?;

    let expected = (samples.len() as f64 * ratio).round() as usize;
    let delay = resampler.output_delay();
    let mut output: Vec<f32> = Vec::with_capacity(expected + delay + chunk_size);

    // zero tail flushes the filter delay
    let mut input = samples.to_vec();
    let flush = ((delay as f64 / ratio).ceil() as usize) + chunk_size;
    input.resize(input.len() + flush, 0.0);

    for chunk in input.chunks(chunk_size) {
        if output.len() >= expected + delay {
            break;
        }
        let frames = if chunk.len() == chunk_size {
            resampler.process(&[chunk], None)
        } else {
            resampler.process_partial(Some(&[chunk]), None)
        }
        .map_err(|e| PipelineError::Resample(e.to_string()))?;
        output.extend_from_slice(&frames[0]);
    }

    let mut aligned: Vec<f32> = output.into_iter().skip(delay).take(expected).collect();
    aligned.resize(expected, 0.0);

    debug!(
        from_rate,
        to_rate,
        input = samples.len(),
        output = aligned.len(),
        "resampled"
    );
    Ok(aligned)
}

/// Compute the p-th percentile of a dataset
pub fn percentile(data: &[f32], p: f32) -> f32 {
    if data.is_empty() {
        return 0.0;
    }

    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let p = p.clamp(0.0, 100.0);
    let rank = (p / 100.0) * (sorted.len() - 1) as f32;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let fraction = rank - lo as f32;

    sorted[lo] + fraction * (sorted[hi] - sorted[lo])
}

pub fn median(data: &[f32]) -> f32 {
    percentile(data, 50.0)
}

/// Mean and population standard deviation
pub fn mean_std(data: &[f32]) -> (f32, f32) {
    if data.is_empty() {
        return (0.0, 0.0);
    }
    let n = data.len() as f32;
    let mean = data.iter().sum::<f32>() / n;
    let var = data.iter().map(|&x| (x - mean).powi(2)).sum::<f32>() / n;
    (mean, var.sqrt())
}

/// Zero crossing count
pub fn zero_crossings(samples: &[f32]) -> usize {
    samples
        .windows(2)
        .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
        .count()
}
