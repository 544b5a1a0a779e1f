//! Pass 5: Role Scoring (rule model, external fusion, guard rails)

use crate::analysis::{
    DspFeatures, FeatureOutcome, GuardFlags, Role, RoleScores, Sample, ScoreBreakdown, TimeShape,
    UnscoreableHit,
};
use crate::collaborators::call_with_timeout;
use crate::config::{Config, GuardConfig, RoleFormulas, Term};
use crate::error::{PipelineError, Result};
use crate::report::GuardConflictRecord;
use crate::state::PipelineState;
use tracing::{debug, info, warn};

pub const STAGE: &str = "scoring";

pub fn term_value(term: Term, dsp: &DspFeatures, shape: &TimeShape) -> f32 {
    match term {
        Term::Energy => dsp.energy,
        Term::InverseEnergy => 1.0 - dsp.energy,
        Term::Sharpness => dsp.sharpness,
        Term::InverseSharpness => 1.0 - dsp.sharpness,
        Term::LowRatio => dsp.low_ratio,
        Term::MidRatio => dsp.mid_ratio,
        Term::HighRatio => dsp.high_ratio,
        Term::LowMidRatio => dsp.low_ratio + dsp.mid_ratio,
        Term::FastAttack => shape.fast_attack,
        Term::ShortDecay => shape.short_decay,
        Term::LongDecay => shape.long_decay,
        Term::Flatness => dsp.spectral_flatness,
        Term::ZeroCrossingRate => dsp.zero_crossing_rate,
    }
}

/// Weighted linear score per role, before the softmax
pub fn raw_scores(dsp: &DspFeatures, shape: &TimeShape, formulas: &RoleFormulas) -> [f32; 5] {
    let mut raw = [0.0f32; 5];
    for role in Role::ALL {
        raw[role.index()] = formulas
            .for_role(role)
            .terms
            .iter()
            .map(|t| t.weight * term_value(t.term, dsp, shape))
            .sum();
    }
    raw
}

/// Rule-derived role distribution
pub fn rule_scores(dsp: &DspFeatures, config: &Config) -> RoleScores {
    let shape = dsp.time_shape(config.features.attack_window_s, config.features.decay_window_s);
    RoleScores::softmax(raw_scores(dsp, &shape, &config.scoring.formulas), config.scoring.tau)
}

/// `alpha * rule + (1 - alpha) * external`, renormalized
pub fn fuse(rule: &RoleScores, external: Option<&RoleScores>, alpha: f32) -> RoleScores {
    let Some(external) = external else {
        return *rule;
    };
    let mut fused = [0.0f32; 5];
    for (i, f) in fused.iter_mut().enumerate() {
        *f = alpha * rule.0[i] + (1.0 - alpha) * external.0[i];
    }
    RoleScores(fused).normalized()
}

/// Scores after one guard, and whether it fired
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuardOutcome {
    pub scores: RoleScores,
    pub fired: bool,
}

fn dampen(scores: &RoleScores, roles: &[Role], factor: f32, fired: bool) -> GuardOutcome {
    if !fired {
        return GuardOutcome {
            scores: scores.normalized(),
            fired,
        };
    }
    let mut out = *scores;
    for &role in roles {
        out.set(role, out.get(role) * factor);
    }
    GuardOutcome {
        scores: out.normalized(),
        fired,
    }
}

/// Sharp, short hits are not textures
pub fn texture_suppression(scores: &RoleScores, dsp: &DspFeatures, cfg: &GuardConfig) -> GuardOutcome {
    let fired = dsp.sharpness >= cfg.texture_sharpness_min && dsp.decay_time <= cfg.texture_decay_max_s;
    dampen(scores, &[Role::Texture], cfg.texture_factor, fired)
}

/// Long noisy tails make poor CORE or ACCENT hits
pub fn sustained_noise_suppression(
    scores: &RoleScores,
    dsp: &DspFeatures,
    cfg: &GuardConfig,
) -> GuardOutcome {
    let fired = dsp.decay_time >= cfg.sustained_decay_min_s
        && dsp.spectral_flatness >= cfg.sustained_flatness_min;
    dampen(scores, &[Role::Core, Role::Accent], cfg.sustained_factor, fired)
}

/// MOTION needs bright and short material
pub fn motion_minimum(scores: &RoleScores, dsp: &DspFeatures, cfg: &GuardConfig) -> GuardOutcome {
    let qualifies = dsp.high_ratio >= cfg.motion_high_min && dsp.decay_time <= cfg.motion_decay_max_s;
    dampen(scores, &[Role::Motion], cfg.motion_factor, !qualifies)
}

/// FILL keeps full weight only when it clearly leads
pub fn fill_conservatism(scores: &RoleScores, cfg: &GuardConfig) -> GuardOutcome {
    let p_fill = scores.get(Role::Fill);
    let lead = p_fill - scores.best_other(Role::Fill);
    let fired = p_fill < cfg.fill_min_prob || lead < cfg.fill_min_margin;
    dampen(scores, &[Role::Fill], cfg.fill_factor, fired)
}

/// Narrow TEXTURE wins over a percussive runner-up are handed back
pub fn low_confidence_texture(scores: &RoleScores, cfg: &GuardConfig) -> GuardOutcome {
    let fired = cfg.low_conf_texture_enabled
        && scores.argmax() == Role::Texture
        && scores.second_best().is_percussive()
        && scores.margin() < cfg.low_conf_margin;
    dampen(scores, &[Role::Texture], cfg.low_conf_factor, fired)
}

/// Apply every guard in order
pub fn apply_guards(scores: &RoleScores, dsp: &DspFeatures, cfg: &GuardConfig) -> (RoleScores, GuardFlags) {
    let mut flags = GuardFlags::default();

    let step = texture_suppression(scores, dsp, cfg);
    flags.texture_suppression = step.fired;
    let step = sustained_noise_suppression(&step.scores, dsp, cfg);
    flags.sustained_noise = step.fired;
    let step = motion_minimum(&step.scores, dsp, cfg);
    flags.motion_minimum = step.fired;
    let step = fill_conservatism(&step.scores, cfg);
    flags.fill_conservative = step.fired;
    let step = low_confidence_texture(&step.scores, cfg);
    flags.low_confidence_texture = step.fired;

    (step.scores, flags)
}

/// Full scoring of one hit's features
pub fn score_features(
    dsp: &DspFeatures,
    external: Option<&RoleScores>,
    config: &Config,
) -> (ScoreBreakdown, GuardFlags) {
    let rule = rule_scores(dsp, config);
    let fused = fuse(&rule, external, config.scoring.alpha);
    let (guarded, flags) = apply_guards(&fused, dsp, &config.scoring.guards);
    (
        ScoreBreakdown {
            rule,
            external: external.copied(),
            fused,
            guarded,
        },
        flags,
    )
}

/// A confident fused decision that the guards overturned
pub fn guard_conflict(
    sample_id: &str,
    scores: &ScoreBreakdown,
    conflict_margin: f32,
) -> Option<GuardConflictRecord> {
    let fused_role = scores.fused.argmax();
    let final_role = scores.guarded.argmax();
    if fused_role != final_role && scores.fused.margin() >= conflict_margin {
        Some(GuardConflictRecord {
            sample_id: sample_id.to_string(),
            fused_role,
            final_role,
            fused: scores.fused,
            guarded: scores.guarded,
        })
    } else {
        None
    }
}

pub fn run(state: &mut PipelineState, config: &Config) -> Result<()> {
    info!("Pass 5: Role Scoring");

    let scorer = state.collaborators.scorer.clone();
    let timeout = state.collaborators.timeout;
    let mut samples = Vec::new();
    let mut unscoreable = Vec::new();
    let mut external_failures: Vec<String> = Vec::new();

    for cluster in &state.clusters {
        let hit = &state.hits[cluster.representative];
        let dsp = match (&state.features[cluster.representative], cluster.scoreable) {
            (FeatureOutcome::Valid { dsp, .. }, true) => *dsp,
            (FeatureOutcome::Invalid { reason }, _) => {
                unscoreable.push(UnscoreableHit {
                    hit_id: hit.id.clone(),
                    reason: PipelineError::InvalidInput(reason.clone()).to_string(),
                });
                continue;
            }
            (FeatureOutcome::Valid { .. }, false) => {
                unscoreable.push(UnscoreableHit {
                    hit_id: hit.id.clone(),
                    reason: "cluster marked unscoreable".to_string(),
                });
                continue;
            }
        };

        let external = scorer.as_ref().and_then(|scorer| {
            let scorer = scorer.clone();
            let name = scorer.name().to_string();
            let request = hit.clone();
            let result = call_with_timeout(&name, timeout, move || scorer.score(&request))
                .and_then(|scores| {
                    scores.validated().ok_or_else(|| {
                        PipelineError::collaborator(&name, format!("malformed distribution {:?}", scores.0))
                    })
                });
            match result {
                Ok(scores) => Some(scores),
                Err(err) => {
                    warn!(hit = %hit.id, error = %err, "falling back to rule-only scores");
                    external_failures.push(err.to_string());
                    None
                }
            }
        });

        let (scores, guards) = score_features(&dsp, external.as_ref(), config);

        if let Some(conflict) = guard_conflict(&hit.id, &scores, config.scoring.conflict_margin) {
            let err = PipelineError::GuardConflict(format!(
                "{}: fused {} ({:?}) overturned to {} ({:?}) by guards {:?}",
                hit.id, conflict.fused_role, scores.fused.0, conflict.final_role, scores.guarded.0, guards
            ));
            warn!(rule = ?scores.rule.0, external = ?scores.external.map(|e| e.0), "{}", err);
            state.report.guard_conflicts.push(conflict);
        }

        let role = scores.guarded.argmax();
        debug!(
            sample = %hit.id,
            %role,
            confidence = scores.guarded.confidence(),
            margin = scores.guarded.margin(),
            "scored"
        );

        samples.push(Sample {
            id: hit.id.clone(),
            hit_id: hit.id.clone(),
            role,
            cluster_size: cluster.members.len(),
            features: dsp,
            scores,
            guards,
            audio: hit.samples.clone(),
            sample_rate: hit.sample_rate,
        });
    }

    if external_failures.is_empty() {
        state.report.succeeded(STAGE);
    } else {
        state.report.degraded(
            STAGE,
            format!(
                "rule-only scores for {} sample(s): {}",
                external_failures.len(),
                external_failures[0]
            ),
        );
    }

    state.report.counts.samples = samples.len();
    state.report.unscoreable = unscoreable.clone();
    state.samples = samples;
    state.unscoreable = unscoreable;

    info!(
        samples = state.samples.len(),
        unscoreable = state.unscoreable.len(),
        "role scoring complete"
    );
    Ok(())
}
