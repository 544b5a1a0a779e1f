//! Validation tests for Pass 3: Per-Hit Feature Extraction

use drumgrid::analysis::{FeatureOutcome, Hit, Onset};
use drumgrid::config::Config;
use drumgrid::passes::pass_3::{self, extract_features};
use drumgrid::state::PipelineState;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f32::consts::PI;

/// Sine burst with exponential decay
fn tone_burst(freq: f32, decay_s: f32, seconds: f32, sr: u32) -> Vec<f32> {
    let n = (seconds * sr as f32) as usize;
    (0..n)
        .map(|i| {
            let t = i as f32 / sr as f32;
            (2.0 * PI * freq * t).sin() * (-t / decay_s).exp() * 0.8
        })
        .collect()
}

/// Seeded white noise with exponential decay
fn noise_burst(decay_s: f32, seconds: f32, sr: u32, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let n = (seconds * sr as f32) as usize;
    (0..n)
        .map(|i| {
            let t = i as f32 / sr as f32;
            rng.gen_range(-1.0f32..1.0) * (-t / decay_s).exp() * 0.6
        })
        .collect()
}

fn hit(id: &str, samples: Vec<f32>, sr: u32) -> Hit {
    let duration = samples.len() as f32 / sr as f32;
    Hit {
        id: id.to_string(),
        onset: Onset {
            time_s: 0.0,
            frame: 0,
            strength: 1.0,
        },
        start_s: 0.0,
        end_s: duration,
        samples,
        sample_rate: sr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_low_burst_features() {
        let config = Config::default();
        let outcome = extract_features(&tone_burst(60.0, 0.03, 0.3, 16000), 16000, &config).unwrap();
        let dsp = outcome.dsp().copied().expect("valid features");

        assert!(dsp.low_ratio > 0.8, "low ratio {}", dsp.low_ratio);
        assert!(dsp.high_ratio < 0.05);
        assert!(dsp.decay_time < 0.2, "decay {}", dsp.decay_time);
        assert!(dsp.attack_time <= config.features.attack_window_s);
        assert!((0.0..=1.0).contains(&dsp.energy));
        assert!((0.0..=1.0).contains(&dsp.sharpness));
        let sum = dsp.low_ratio + dsp.mid_ratio + dsp.high_ratio;
        assert!((sum - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_noise_burst_is_bright_and_flat() {
        let config = Config::default();
        let outcome = extract_features(&noise_burst(0.05, 0.3, 16000, 3), 16000, &config).unwrap();
        let dsp = outcome.dsp().copied().expect("valid features");
        let tone = extract_features(&tone_burst(60.0, 0.03, 0.3, 16000), 16000, &config)
            .unwrap()
            .dsp()
            .copied()
            .expect("valid features");

        assert!(dsp.high_ratio > 0.5, "high ratio {}", dsp.high_ratio);
        assert!(dsp.spectral_flatness > tone.spectral_flatness);
        assert!(dsp.zero_crossing_rate > tone.zero_crossing_rate);
    }

    #[test]
    fn test_embedding_layout() {
        let config = Config::default();
        let outcome = extract_features(&tone_burst(300.0, 0.05, 0.3, 16000), 16000, &config).unwrap();
        let embedding = outcome.embedding().expect("embedding");
        assert_eq!(embedding.len(), config.features.n_mfcc + 7);
        assert!(embedding.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_other_sample_rates_are_resampled() {
        let config = Config::default();
        let native = extract_features(&tone_burst(80.0, 0.04, 0.3, 44100), 44100, &config).unwrap();
        let dsp = native.dsp().copied().expect("valid features");
        assert!(dsp.low_ratio > 0.8);
    }

    #[test]
    fn test_silent_hit_is_flagged_not_fatal() {
        let mut state = PipelineState::from_samples(Vec::new(), 16000);
        state.hits = vec![
            hit("hit_000", tone_burst(60.0, 0.03, 0.3, 16000), 16000),
            hit("hit_001", vec![0.0; 4800], 16000),
            hit("hit_002", noise_burst(0.05, 0.3, 16000, 9), 16000),
        ];
        pass_3::run(&mut state, &Config::default()).unwrap();

        assert_eq!(state.features.len(), 3);
        assert!(state.features[0].is_valid());
        assert!(matches!(state.features[1], FeatureOutcome::Invalid { .. }));
        assert!(state.features[2].is_valid());
    }

    #[test]
    fn test_identical_hits_have_identical_features() {
        let config = Config::default();
        let a = extract_features(&tone_burst(120.0, 0.05, 0.3, 16000), 16000, &config).unwrap();
        let b = extract_features(&tone_burst(120.0, 0.05, 0.3, 16000), 16000, &config).unwrap();
        assert_eq!(a, b);
    }
}
