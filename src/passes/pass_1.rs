//! Pass 1: Multi-Band Onset Detection

use crate::analysis::Onset;
use crate::audio::{mean_std, AudioBuffer};
use crate::config::{Config, MergePolicy, OnsetConfig, StftConfig};
use crate::error::Result;
use crate::spectral::{band_flux, frame_rms, magnitude_spectrogram, stft};
use crate::state::PipelineState;
use tracing::{debug, info};

pub const STAGE: &str = "onsets";

/// Onset intensity envelope plus the frame energy used for backtracking
#[derive(Debug, Clone)]
pub struct OnsetEnvelope {
    pub envelope: Vec<f32>,
    pub energy: Vec<f32>,
    pub frame_rate: f32,
}

/// Sum the positive spectral flux of each frequency band into one envelope
pub fn onset_envelope(audio: &AudioBuffer, stft_cfg: &StftConfig, onset_cfg: &OnsetConfig) -> OnsetEnvelope {
    let data = stft(
        &audio.samples,
        stft_cfg.n_fft,
        stft_cfg.hop_length,
        &stft_cfg.window,
        audio.sample_rate,
        true,
    );
    let mag = magnitude_spectrogram(&data);
    let nyquist = audio.sample_rate as f32 / 2.0;

    let mut edges = onset_cfg.band_edges_hz.clone();
    edges.push(nyquist + 1.0);

    let mut envelope = vec![0.0f32; data.n_frames()];
    for band in edges.windows(2) {
        let flux = band_flux(&mag, &data.freqs, band[0], band[1]);
        for (e, f) in envelope.iter_mut().zip(flux) {
            *e += f;
        }
    }

    let mut energy = frame_rms(&audio.samples, stft_cfg.n_fft, stft_cfg.hop_length);
    energy.resize(envelope.len(), 0.0);

    OnsetEnvelope {
        envelope,
        energy,
        frame_rate: audio.sample_rate as f32 / stft_cfg.hop_length as f32,
    }
}

/// Compute adaptive threshold using rolling mean and std
pub fn adaptive_threshold(signal: &[f32], window_frames: usize, k: f32) -> Vec<f32> {
    let half = window_frames / 2;
    (0..signal.len())
        .map(|i| {
            let start = i.saturating_sub(half);
            let end = signal.len().min(i + half + 1);
            let (mean, std) = mean_std(&signal[start..end]);
            mean + k * std
        })
        .collect()
}

/// Local maxima strictly above their threshold and the global floor
pub fn pick_peaks(signal: &[f32], thresholds: &[f32], floor: f32) -> Vec<usize> {
    let mut peaks = Vec::new();
    for i in 0..signal.len() {
        let prev = if i > 0 { signal[i - 1] } else { f32::NEG_INFINITY };
        let next = signal.get(i + 1).copied().unwrap_or(f32::NEG_INFINITY);
        let v = signal[i];
        if v >= prev && v > next && v > thresholds[i] && v > floor {
            peaks.push(i);
        }
    }
    peaks
}

/// Walk back from `frame` to the preceding local minimum of `energy`
pub fn backtrack(frame: usize, energy: &[f32]) -> usize {
    let mut f = frame.min(energy.len().saturating_sub(1));
    while f > 0 && energy[f - 1] < energy[f] {
        f -= 1;
    }
    f
}

/// Collapse onsets closer than `window_s`. Input must be time-ordered;
/// output is time-ordered and a fixed point of this function.
pub fn merge_onsets(onsets: &[Onset], window_s: f32, policy: MergePolicy) -> Vec<Onset> {
    match policy {
        MergePolicy::KeepEarlier => {
            let mut merged: Vec<Onset> = Vec::with_capacity(onsets.len());
            for onset in onsets {
                match merged.last() {
                    Some(last) if onset.time_s - last.time_s < window_s => {}
                    _ => merged.push(*onset),
                }
            }
            merged
        }
        MergePolicy::KeepStronger => {
            let mut order: Vec<usize> = (0..onsets.len()).collect();
            order.sort_by(|&a, &b| {
                onsets[b]
                    .strength
                    .total_cmp(&onsets[a].strength)
                    .then(a.cmp(&b))
            });
            let mut kept: Vec<Onset> = Vec::new();
            for idx in order {
                let candidate = onsets[idx];
                if kept
                    .iter()
                    .all(|k| (k.time_s - candidate.time_s).abs() >= window_s)
                {
                    kept.push(candidate);
                }
            }
            kept.sort_by(|a, b| a.time_s.total_cmp(&b.time_s));
            kept
        }
    }
}

/// Detect onsets in the whole signal
pub fn detect_onsets(audio: &AudioBuffer, config: &Config) -> Vec<Onset> {
    if audio.is_empty() || audio.sample_rate == 0 {
        return Vec::new();
    }

    let cfg = &config.onset;
    let env = onset_envelope(audio, &config.stft, cfg);
    let max_env = env.envelope.iter().copied().fold(0.0f32, f32::max);

    let window_frames = ((cfg.threshold_window_s * env.frame_rate).round() as usize).max(3);
    let thresholds = adaptive_threshold(&env.envelope, window_frames, cfg.threshold_k);
    let floor = (cfg.delta * max_env).max(cfg.min_strength);
    let peaks = pick_peaks(&env.envelope, &thresholds, floor);

    debug!(
        frames = env.envelope.len(),
        peaks = peaks.len(),
        floor,
        "onset envelope analysed"
    );

    let candidates: Vec<Onset> = peaks
        .iter()
        .map(|&peak| {
            let frame = if cfg.backtrack {
                backtrack(peak, &env.energy)
            } else {
                peak
            };
            Onset {
                time_s: frame as f32 / env.frame_rate,
                frame,
                strength: env.envelope[peak],
            }
        })
        .collect();

    merge_onsets(&candidates, cfg.merge_ms / 1000.0, cfg.merge_policy)
}

pub fn run(state: &mut PipelineState, config: &Config) -> Result<()> {
    info!("Pass 1: Onset Detection");

    state.onsets = detect_onsets(&state.audio, config);
    state.report.counts.onsets = state.onsets.len();
    state.report.succeeded(STAGE);

    info!(onsets = state.onsets.len(), "onset detection complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn onset(time_s: f32, strength: f32) -> Onset {
        Onset {
            time_s,
            frame: 0,
            strength,
        }
    }

    #[test]
    fn test_keep_earlier_keeps_first_of_cluster() {
        let onsets = vec![onset(0.0, 1.0), onset(0.05, 3.0), onset(0.2, 1.0)];
        let merged = merge_onsets(&onsets, 0.1, MergePolicy::KeepEarlier);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].time_s, 0.0);
    }

    #[test]
    fn test_keep_stronger_keeps_loudest_of_cluster() {
        let onsets = vec![onset(0.0, 1.0), onset(0.05, 3.0), onset(0.2, 1.0)];
        let merged = merge_onsets(&onsets, 0.1, MergePolicy::KeepStronger);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].time_s, 0.05);
        assert_eq!(merged[1].time_s, 0.2);
    }

    #[test]
    fn test_backtrack_stops_at_silence() {
        let energy = [0.0, 0.0, 0.1, 0.5, 0.9, 0.7];
        assert_eq!(backtrack(4, &energy), 1);
        assert_eq!(backtrack(0, &energy), 0);
    }

    #[test]
    fn test_pick_peaks_respects_floor() {
        let signal = [0.0, 1.0, 0.0, 0.3, 0.0];
        let thresholds = [0.0; 5];
        assert_eq!(pick_peaks(&signal, &thresholds, 0.0), vec![1, 3]);
        assert_eq!(pick_peaks(&signal, &thresholds, 0.5), vec![1]);
    }
}
