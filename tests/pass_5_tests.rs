//! Validation tests for Pass 5: Role Scoring

use drumgrid::analysis::{Cluster, DspFeatures, FeatureOutcome, Hit, Onset, Role, RoleScores};
use drumgrid::collaborators::{Collaborators, PrecomputedScores, SemanticScorer};
use drumgrid::config::{Config, GuardConfig};
use drumgrid::error::Result;
use drumgrid::passes::pass_3::extract_features;
use drumgrid::passes::pass_5::{
    self, apply_guards, fill_conservatism, fuse, low_confidence_texture, motion_minimum,
    rule_scores, score_features, sustained_noise_suppression, texture_suppression,
};
use drumgrid::report::StageStatus;
use drumgrid::state::PipelineState;
use std::collections::HashMap;
use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;

const SR: u32 = 16000;

/// Low sine under a 30 ms decay, the archetypal kick
fn kick_burst() -> Vec<f32> {
    (0..(0.3 * SR as f32) as usize)
        .map(|i| {
            let t = i as f32 / SR as f32;
            (2.0 * PI * 60.0 * t).sin() * (-t / 0.03).exp() * 0.8
        })
        .collect()
}

fn features(energy: f32, sharpness: f32, decay: f32, bands: [f32; 3], flatness: f32) -> DspFeatures {
    DspFeatures {
        energy,
        sharpness,
        attack_time: 0.005,
        decay_time: decay,
        low_ratio: bands[0],
        mid_ratio: bands[1],
        high_ratio: bands[2],
        spectral_flatness: flatness,
        zero_crossing_rate: 0.1,
    }
}

fn hit(id: &str, samples: Vec<f32>) -> Hit {
    let end_s = samples.len() as f32 / SR as f32;
    Hit {
        id: id.to_string(),
        onset: Onset {
            time_s: 0.0,
            frame: 0,
            strength: 1.0,
        },
        start_s: 0.0,
        end_s,
        samples,
        sample_rate: SR,
    }
}

/// State with one scoreable kick and one unscoreable hit, clustered
fn scored_state(config: &Config) -> PipelineState {
    let mut state = PipelineState::from_samples(Vec::new(), SR);
    let kick = kick_burst();
    state.features = vec![
        extract_features(&kick, SR, config).unwrap(),
        FeatureOutcome::Invalid {
            reason: "silent".to_string(),
        },
    ];
    state.hits = vec![hit("hit_000", kick), hit("hit_001", vec![0.0; 1600])];
    state.clusters = vec![
        Cluster {
            members: vec![0],
            representative: 0,
            scoreable: true,
        },
        Cluster {
            members: vec![1],
            representative: 1,
            scoreable: false,
        },
    ];
    state
}

struct FailingScorer;

impl SemanticScorer for FailingScorer {
    fn score(&self, _hit: &Hit) -> Result<RoleScores> {
        Ok(RoleScores([f32::NAN, 0.2, 0.2, 0.2, 0.2]))
    }
}

struct SlowScorer;

impl SemanticScorer for SlowScorer {
    fn score(&self, _hit: &Hit) -> Result<RoleScores> {
        std::thread::sleep(Duration::from_millis(500));
        Ok(RoleScores::uniform())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kick_burst_scores_core_at_sharp_temperature() {
        let mut config = Config::default();
        config.scoring.tau = 0.1;
        let dsp = *extract_features(&kick_burst(), SR, &config)
            .unwrap()
            .dsp()
            .expect("valid features");

        let rule = rule_scores(&dsp, &config);
        assert_eq!(rule.argmax(), Role::Core);
        assert!(rule.get(Role::Core) > 0.5, "p_core {}", rule.get(Role::Core));

        let (scores, _) = score_features(&dsp, None, &config);
        assert_eq!(scores.guarded.argmax(), Role::Core);
    }

    #[test]
    fn test_default_temperature_caps_confidence() {
        let config = Config::default();
        let dsp = *extract_features(&kick_burst(), SR, &config)
            .unwrap()
            .dsp()
            .expect("valid features");
        let rule = rule_scores(&dsp, &config);
        assert_eq!(rule.argmax(), Role::Core);
        assert!(rule.confidence() < 0.5);
    }

    #[test]
    fn test_every_guard_keeps_distribution_normalized() {
        let cfg = GuardConfig::default();
        let cases = [
            features(0.9, 0.9, 0.05, [0.1, 0.3, 0.6], 0.2),
            features(0.2, 0.1, 0.55, [0.2, 0.3, 0.5], 0.8),
            features(0.5, 0.4, 0.2, [0.9, 0.08, 0.02], 0.1),
        ];
        let inputs = [
            RoleScores([0.2, 0.2, 0.2, 0.2, 0.2]),
            RoleScores([0.1, 0.1, 0.1, 0.1, 0.6]),
            RoleScores([0.31, 0.05, 0.05, 0.29, 0.30]),
        ];
        for dsp in &cases {
            for scores in &inputs {
                for out in [
                    texture_suppression(scores, dsp, &cfg),
                    sustained_noise_suppression(scores, dsp, &cfg),
                    motion_minimum(scores, dsp, &cfg),
                    fill_conservatism(scores, &cfg),
                    low_confidence_texture(scores, &cfg),
                ] {
                    assert!(out.scores.is_normalized(1e-5), "{:?}", out);
                }
                let (guarded, _) = apply_guards(scores, dsp, &cfg);
                assert!(guarded.is_normalized(1e-5));
            }
        }
    }

    #[test]
    fn test_sharp_short_hits_lose_texture() {
        let cfg = GuardConfig::default();
        let dsp = features(0.9, 0.9, 0.05, [0.1, 0.3, 0.6], 0.2);
        let scores = RoleScores([0.1, 0.1, 0.1, 0.1, 0.6]);
        let out = texture_suppression(&scores, &dsp, &cfg);
        assert!(out.fired);
        assert!(out.scores.get(Role::Texture) < 0.6);

        let (_, flags) = apply_guards(&scores, &dsp, &cfg);
        assert!(flags.texture_suppression);
        assert!(!flags.sustained_noise);
        assert!(flags.disqualifies(Role::Texture));
    }

    #[test]
    fn test_sustained_noise_dampens_core_and_accent() {
        let cfg = GuardConfig::default();
        let dsp = features(0.2, 0.1, 0.55, [0.2, 0.3, 0.5], 0.8);
        let scores = RoleScores([0.4, 0.3, 0.1, 0.1, 0.1]);
        let out = sustained_noise_suppression(&scores, &dsp, &cfg);
        assert!(out.fired);
        let expected_core = 0.4 * 0.75 / (0.4 * 0.75 + 0.3 * 0.75 + 0.3);
        assert!((out.scores.get(Role::Core) - expected_core).abs() < 1e-5);
    }

    #[test]
    fn test_fusion_with_external_scores() {
        let rule = RoleScores([0.5, 0.2, 0.1, 0.1, 0.1]);
        let external = RoleScores([0.0, 0.0, 0.0, 0.0, 1.0]);
        let fused = fuse(&rule, Some(&external), 0.9);
        assert!(fused.is_normalized(1e-6));
        assert!((fused.get(Role::Texture) - 0.19).abs() < 1e-6);
        assert!((fused.get(Role::Core) - 0.45).abs() < 1e-6);
    }

    #[test]
    fn test_unscoreable_hits_are_reported_not_defaulted() {
        let config = Config::default();
        let mut state = scored_state(&config);
        pass_5::run(&mut state, &config).unwrap();

        assert_eq!(state.samples.len(), 1);
        assert_eq!(state.samples[0].id, "hit_000");
        assert_eq!(state.unscoreable.len(), 1);
        assert_eq!(state.unscoreable[0].hit_id, "hit_001");
        assert!(state.unscoreable[0].reason.contains("E001"));
        assert_eq!(state.report.status_of(pass_5::STAGE), Some(StageStatus::Succeeded));
    }

    #[test]
    fn test_precomputed_scores_are_fused() {
        let config = Config::default();
        let mut table = HashMap::new();
        table.insert("hit_000".to_string(), RoleScores([0.0, 0.0, 0.0, 0.0, 1.0]));
        let collaborators = Collaborators::default().with_scorer(Arc::new(PrecomputedScores::new(table)));
        let mut state = scored_state(&config).with_collaborators(collaborators);
        pass_5::run(&mut state, &config).unwrap();

        let sample = &state.samples[0];
        let external = sample.scores.external.expect("external scores");
        assert_eq!(external.argmax(), Role::Texture);
        assert!(sample.scores.fused.get(Role::Texture) > sample.scores.rule.get(Role::Texture));
        assert!(sample.scores.fused.is_normalized(1e-5));
    }

    #[test]
    fn test_malformed_external_scores_fall_back_to_rules() {
        let config = Config::default();
        let collaborators = Collaborators::default().with_scorer(Arc::new(FailingScorer));
        let mut state = scored_state(&config).with_collaborators(collaborators);
        pass_5::run(&mut state, &config).unwrap();

        let sample = &state.samples[0];
        assert!(sample.scores.external.is_none());
        assert_eq!(sample.scores.fused, sample.scores.rule);
        assert_eq!(state.report.status_of(pass_5::STAGE), Some(StageStatus::Degraded));
    }

    #[test]
    fn test_scorer_timeout_falls_back_to_rules() {
        let config = Config::default();
        let collaborators = Collaborators::default()
            .with_scorer(Arc::new(SlowScorer))
            .with_timeout(Duration::from_millis(30));
        let mut state = scored_state(&config).with_collaborators(collaborators);
        pass_5::run(&mut state, &config).unwrap();

        assert!(state.samples[0].scores.external.is_none());
        let reason = state.report.stage(pass_5::STAGE).and_then(|r| r.reason.clone()).unwrap();
        assert!(reason.contains("timed out"));
    }
}
