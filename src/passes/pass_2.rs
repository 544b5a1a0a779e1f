//! Pass 2: Hit Slicing

use crate::analysis::{Hit, Onset};
use crate::audio::{peak, AudioBuffer};
use crate::config::{Config, SlicerConfig};
use crate::error::Result;
use crate::state::PipelineState;
use tracing::{debug, info};

pub const STAGE: &str = "slicing";

/// Drop the trailing run of samples more than `top_db` below the peak
pub fn trim_trailing_silence(samples: &mut Vec<f32>, top_db: f32) {
    let threshold = peak(samples) * 10f32.powf(-top_db / 20.0);
    let end = samples
        .iter()
        .rposition(|&x| x != 0.0 && x.abs() >= threshold)
        .map_or(0, |i| i + 1);
    samples.truncate(end);
}

/// Linear fade to zero over the last `fade_len` samples
pub fn apply_fade_out(samples: &mut [f32], fade_len: usize) {
    let n = fade_len.min(samples.len());
    if n == 0 {
        return;
    }
    let start = samples.len() - n;
    for (j, sample) in samples[start..].iter_mut().enumerate() {
        *sample *= (n - 1 - j) as f32 / n as f32;
    }
}

/// Cut one hit per onset, bounded by the next onset and the duration cap
pub fn slice_hits(audio: &AudioBuffer, onsets: &[Onset], cfg: &SlicerConfig) -> Vec<Hit> {
    let sr = audio.sample_rate as f32;
    let total_s = audio.duration_s();
    let fade_len = (cfg.fade_out_ms / 1000.0 * sr).round() as usize;
    let mut hits = Vec::with_capacity(onsets.len());

    for (i, onset) in onsets.iter().enumerate() {
        let next_s = onsets.get(i + 1).map_or(total_s, |n| n.time_s);
        let end_s = next_s.min(onset.time_s + cfg.max_hit_duration_s).min(total_s);

        let start = ((onset.time_s * sr).round() as usize).min(audio.samples.len());
        let end = ((end_s * sr).round() as usize).clamp(start, audio.samples.len());

        let mut samples = audio.samples[start..end].to_vec();
        trim_trailing_silence(&mut samples, cfg.trim_silence_db);
        apply_fade_out(&mut samples, fade_len);

        let duration_s = samples.len() as f32 / sr;
        if duration_s < cfg.min_hit_duration_s {
            debug!(
                onset_s = onset.time_s,
                duration_s, "discarding hit shorter than the minimum"
            );
            continue;
        }

        hits.push(Hit {
            id: format!("hit_{:03}", hits.len()),
            onset: *onset,
            start_s: start as f32 / sr,
            end_s: (start + samples.len()) as f32 / sr,
            samples,
            sample_rate: audio.sample_rate,
        });
    }

    hits
}

pub fn run(state: &mut PipelineState, config: &Config) -> Result<()> {
    info!("Pass 2: Hit Slicing");

    state.hits = slice_hits(&state.audio, &state.onsets, &config.slicer);
    state.report.counts.hits = state.hits.len();
    state.report.succeeded(STAGE);

    info!(
        hits = state.hits.len(),
        discarded = state.onsets.len() - state.hits.len(),
        "slicing complete"
    );
    Ok(())
}
