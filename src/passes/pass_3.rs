//! Pass 3: Per-Hit Feature Extraction

use crate::analysis::{DspFeatures, FeatureOutcome};
use crate::audio::{median, peak, peak_normalize, resample, trim_silence};
use crate::config::{Config, FeatureConfig};
use crate::error::Result;
use crate::spectral::{
    band_bins, frame_rms, frame_zero_crossing_rate, magnitude_spectrogram, mean_mfcc,
    mel_filterbank, power_spectrogram, spectral_flatness, spectral_flux, stft,
};
use crate::state::PipelineState;
use ndarray::{s, Array2};
use rayon::prelude::*;
use tracing::{debug, info};

pub const STAGE: &str = "features";

/// Frames quieter than this (after peak normalization) are ignored by
/// the median-based descriptors
const ACTIVE_FRAME_RMS: f32 = 1e-3;

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) })
        .0
}

/// Seconds from the onset frame until RMS covers `rise` of the climb to its peak
pub fn attack_time(rms: &[f32], flux: &[f32], frame_rate: f32, rise: f32) -> f32 {
    if rms.is_empty() {
        return 0.0;
    }
    let peak_frame = argmax(rms);
    let onset_frame = peak_frame.min(argmax(flux));
    let baseline = rms[onset_frame];
    let target = baseline + rise * (rms[peak_frame] - baseline);
    let reached = (onset_frame..=peak_frame)
        .find(|&f| rms[f] >= target)
        .unwrap_or(peak_frame);
    (reached - onset_frame) as f32 / frame_rate
}

/// Seconds from the RMS peak until it falls to `floor` of the peak
pub fn decay_time(rms: &[f32], frame_rate: f32, floor: f32) -> f32 {
    if rms.is_empty() {
        return 0.0;
    }
    let peak_frame = argmax(rms);
    let target = floor * rms[peak_frame];
    let end = (peak_frame + 1..rms.len())
        .find(|&f| rms[f] <= target)
        .unwrap_or(rms.len());
    (end - peak_frame) as f32 / frame_rate
}

/// Power fractions in the low, mid and high bands, summing to 1
pub fn band_ratios(power: &Array2<f32>, freqs: &[f32], cfg: &FeatureConfig) -> [f32; 3] {
    let band_power = |band: [f32; 2]| {
        let (lo, hi) = band_bins(freqs, band[0], band[1]);
        power.slice(s![lo..hi, ..]).sum()
    };
    let low = band_power(cfg.low_band_hz);
    let mid = band_power(cfg.mid_band_hz);
    let high = band_power(cfg.high_band_hz);
    let total = low + mid + high;
    if total <= f32::EPSILON {
        return [1.0 / 3.0; 3];
    }
    [low / total, mid / total, high / total]
}

/// DSP descriptors and timbre embedding of a conditioned signal
pub fn analyse(y: &[f32], sample_rate: u32, config: &Config) -> (DspFeatures, Vec<f32>) {
    let stft_cfg = &config.stft;
    let cfg = &config.features;
    let frame_rate = sample_rate as f32 / stft_cfg.hop_length as f32;

    let data = stft(y, stft_cfg.n_fft, stft_cfg.hop_length, &stft_cfg.window, sample_rate, true);
    let mag = magnitude_spectrogram(&data);
    let power = power_spectrogram(&data);

    let mut rms = frame_rms(y, stft_cfg.n_fft, stft_cfg.hop_length);
    rms.resize(data.n_frames(), 0.0);
    let flux = spectral_flux(&mag);

    let energy = rms.iter().copied().fold(0.0f32, f32::max).clamp(0.0, 1.0);

    let max_frame_mag = mag
        .columns()
        .into_iter()
        .map(|c| c.sum())
        .fold(0.0f32, f32::max);
    let max_flux = flux.iter().copied().fold(0.0f32, f32::max);
    let sharpness = (max_flux / (max_frame_mag + 1e-9)).clamp(0.0, 1.0);

    let attack = attack_time(&rms, &flux, frame_rate, cfg.attack_rise).min(cfg.attack_window_s);
    let decay = decay_time(&rms, frame_rate, cfg.decay_floor).min(cfg.decay_window_s);

    let [low_ratio, mid_ratio, high_ratio] = band_ratios(&power, &data.freqs, cfg);

    let active: Vec<bool> = rms.iter().map(|&r| r >= ACTIVE_FRAME_RMS).collect();
    let pick_active = |values: Vec<f32>| -> Vec<f32> {
        let kept: Vec<f32> = values
            .iter()
            .zip(&active)
            .filter_map(|(&v, &a)| a.then_some(v))
            .collect();
        if kept.is_empty() {
            values
        } else {
            kept
        }
    };
    let flatness = median(&pick_active(spectral_flatness(&power)));
    let mut zcr = frame_zero_crossing_rate(y, stft_cfg.n_fft, stft_cfg.hop_length);
    zcr.resize(data.n_frames(), 0.0);
    let zero_crossing_rate = median(&pick_active(zcr));

    let dsp = DspFeatures {
        energy,
        sharpness,
        attack_time: attack,
        decay_time: decay,
        low_ratio,
        mid_ratio,
        high_ratio,
        spectral_flatness: flatness,
        zero_crossing_rate,
    };

    let fmax = (sample_rate as f32 / 2.0).min(8000.0);
    let mel_fb = mel_filterbank(cfg.n_mels, stft_cfg.n_fft, sample_rate, 0.0, fmax);
    let mut embedding = mean_mfcc(&power, &mel_fb, cfg.n_mfcc);
    embedding.extend([
        dsp.energy,
        dsp.sharpness,
        dsp.low_ratio,
        dsp.mid_ratio,
        dsp.high_ratio,
        dsp.attack_time,
        dsp.decay_time,
    ]);

    (dsp, embedding)
}

/// Resample, normalize and trim one hit, then analyse it.
///
/// Silent or too-short hits come back as [`FeatureOutcome::Invalid`].
pub fn extract_features(samples: &[f32], sample_rate: u32, config: &Config) -> Result<FeatureOutcome> {
    let audio_cfg = &config.audio;

    if peak(samples) < audio_cfg.silence_peak {
        return Ok(FeatureOutcome::Invalid {
            reason: "silent".to_string(),
        });
    }

    let target_sr = audio_cfg.analysis_sample_rate;
    let resampled = resample(samples, sample_rate, target_sr)?;
    let normalized = peak_normalize(&resampled, audio_cfg.peak_target);
    let range = trim_silence(&normalized, audio_cfg.trim_top_db);
    let y = &normalized[range];

    let duration_s = y.len() as f32 / target_sr as f32;
    if duration_s < audio_cfg.min_analysis_duration_s {
        return Ok(FeatureOutcome::Invalid {
            reason: format!(
                "{:.1} ms after trimming, below the {:.1} ms minimum",
                duration_s * 1000.0,
                audio_cfg.min_analysis_duration_s * 1000.0
            ),
        });
    }

    let (dsp, embedding) = analyse(y, target_sr, config);
    Ok(FeatureOutcome::Valid { dsp, embedding })
}

pub fn run(state: &mut PipelineState, config: &Config) -> Result<()> {
    info!("Pass 3: Feature Extraction");

    state.features = state
        .hits
        .par_iter()
        .map(|hit| extract_features(&hit.samples, hit.sample_rate, config))
        .collect::<Result<Vec<_>>>()?;

    for (hit, outcome) in state.hits.iter().zip(&state.features) {
        if let FeatureOutcome::Invalid { reason } = outcome {
            debug!(hit = %hit.id, %reason, "hit has no usable features");
        }
    }

    let valid = state.features.iter().filter(|f| f.is_valid()).count();
    state.report.succeeded(STAGE);
    info!(
        valid,
        invalid = state.features.len() - valid,
        "feature extraction complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attack_and_decay_from_envelope() {
        let rms = [0.0, 0.2, 0.6, 1.0, 0.8, 0.5, 0.25, 0.1];
        let flux = [0.0, 0.5, 0.4, 0.3, 0.0, 0.0, 0.0, 0.0];
        // onset at frame 1, 90% of the rise is first reached at frame 3
        assert!((attack_time(&rms, &flux, 10.0, 0.9) - 0.2).abs() < 1e-6);
        // peak at frame 3, first <= 0.3 at frame 6
        assert!((decay_time(&rms, 10.0, 0.3) - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_decay_runs_to_end_without_release() {
        let rms = [0.5, 1.0, 0.9, 0.8];
        assert!((decay_time(&rms, 10.0, 0.3) - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_silent_hit_is_invalid() {
        let config = Config::default();
        let outcome = extract_features(&vec![0.0; 4000], 16000, &config).unwrap();
        assert!(matches!(outcome, FeatureOutcome::Invalid { .. }));
    }

    #[test]
    fn test_tiny_blip_is_too_short() {
        let config = Config::default();
        let mut samples = vec![0.0; 4000];
        samples[2000] = 0.8;
        let outcome = extract_features(&samples, 16000, &config).unwrap();
        match outcome {
            FeatureOutcome::Invalid { reason } => assert!(reason.contains("minimum")),
            other => panic!("expected invalid outcome, got {:?}", other),
        }
    }
}
