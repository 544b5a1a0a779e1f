//! Validation tests for Pass 1: Multi-Band Onset Detection

use drumgrid::analysis::Onset;
use drumgrid::audio::AudioBuffer;
use drumgrid::config::{Config, MergePolicy};
use drumgrid::passes::pass_1::{self, adaptive_threshold, detect_onsets, merge_onsets};
use drumgrid::state::PipelineState;
use std::f32::consts::PI;

const SR: u32 = 16000;

/// 1.5 kHz tone under a 20 ms exponential decay, 250 ms long
fn click_template(sr: u32) -> Vec<f32> {
    let n = (0.25 * sr as f32) as usize;
    (0..n)
        .map(|i| {
            let t = i as f32 / sr as f32;
            (2.0 * PI * 1500.0 * t).sin() * (-t / 0.02).exp() * 0.8
        })
        .collect()
}

/// Identical clicks pasted at the given times
fn click_track(times: &[f32], seconds: f32, sr: u32) -> Vec<f32> {
    let template = click_template(sr);
    let mut audio = vec![0.0; (seconds * sr as f32) as usize];
    for &t in times {
        let start = (t * sr as f32).round() as usize;
        for (i, &x) in template.iter().enumerate() {
            if let Some(slot) = audio.get_mut(start + i) {
                *slot += x;
            }
        }
    }
    audio
}

fn onsets_at(times: &[f32], strengths: &[f32]) -> Vec<Onset> {
    times
        .iter()
        .zip(strengths)
        .map(|(&time_s, &strength)| Onset {
            time_s,
            frame: 0,
            strength,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sixteen_even_clicks() {
        let times: Vec<f32> = (0..16).map(|k| 0.1 + 0.5 * k as f32).collect();
        let audio = AudioBuffer::new(click_track(&times, 8.0, SR), SR);
        let onsets = detect_onsets(&audio, &Config::default());

        assert_eq!(onsets.len(), 16);
        for (onset, &expected) in onsets.iter().zip(&times) {
            // backtracking may move an onset up to one analysis window early
            assert!(onset.time_s <= expected + 0.02, "onset {} late for {}", onset.time_s, expected);
            assert!(onset.time_s >= expected - 0.1, "onset {} early for {}", onset.time_s, expected);
        }
    }

    #[test]
    fn test_onsets_are_time_ordered_and_spaced() {
        let times = [0.2, 0.9, 1.4, 2.6];
        let audio = AudioBuffer::new(click_track(&times, 3.0, SR), SR);
        let config = Config::default();
        let onsets = detect_onsets(&audio, &config);

        assert_eq!(onsets.len(), times.len());
        for pair in onsets.windows(2) {
            assert!(pair[1].time_s - pair[0].time_s >= config.onset.merge_ms / 1000.0);
        }
    }

    #[test]
    fn test_silence_has_no_onsets() {
        let audio = AudioBuffer::new(vec![0.0; SR as usize], SR);
        assert!(detect_onsets(&audio, &Config::default()).is_empty());

        let empty = AudioBuffer::new(Vec::new(), SR);
        assert!(detect_onsets(&empty, &Config::default()).is_empty());
    }

    #[test]
    fn test_merge_is_idempotent_for_both_policies() {
        let onsets = onsets_at(
            &[0.0, 0.04, 0.09, 0.15, 0.16, 0.40, 0.45, 0.52, 0.90],
            &[1.0, 2.0, 0.5, 3.0, 1.0, 0.2, 0.9, 0.4, 1.0],
        );
        for policy in [MergePolicy::KeepEarlier, MergePolicy::KeepStronger] {
            let once = merge_onsets(&onsets, 0.1, policy);
            let twice = merge_onsets(&once, 0.1, policy);
            assert_eq!(once, twice, "{:?} is not idempotent", policy);
            for pair in once.windows(2) {
                assert!(pair[1].time_s - pair[0].time_s >= 0.1 - 1e-6);
            }
        }
    }

    #[test]
    fn test_adaptive_threshold_tracks_local_level() {
        let mut signal = vec![0.1; 40];
        signal[20] = 5.0;
        let thresholds = adaptive_threshold(&signal, 9, 1.0);
        assert!(thresholds[20] > thresholds[0]);
        assert!(signal[20] > thresholds[20]);
        assert!((thresholds[0] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_run_records_onset_count() {
        let times = [0.25, 0.75];
        let mut state = PipelineState::from_samples(click_track(&times, 1.5, SR), SR);
        pass_1::run(&mut state, &Config::default()).unwrap();
        assert_eq!(state.onsets.len(), 2);
        assert_eq!(state.report.counts.onsets, 2);
    }
}
