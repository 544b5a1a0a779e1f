//! Pass 0: Preflight & Source Separation

use crate::audio::AudioBuffer;
use crate::collaborators::{call_with_timeout, Collaborators};
use crate::config::{validate_config, Config};
use crate::error::Result;
use crate::state::PipelineState;
use tracing::{info, warn};

pub const STAGE: &str = "preflight";

/// Why separation was or was not attempted
#[derive(Debug, Clone, PartialEq)]
pub enum SeparationDecision {
    Separate,
    Bypass(String),
}

/// Separation runs only on full mixes longer than a one-shot
pub fn separation_decision(
    audio: &AudioBuffer,
    config: &Config,
    collaborators: &Collaborators,
) -> SeparationDecision {
    if !config.audio.full_mix {
        return SeparationDecision::Bypass("input is not flagged as a full mix".to_string());
    }
    if audio.duration_s() < config.audio.one_shot_threshold_s {
        return SeparationDecision::Bypass(format!(
            "{:.2}s input is below the {:.1}s one-shot threshold",
            audio.duration_s(),
            config.audio.one_shot_threshold_s
        ));
    }
    if collaborators.separator.is_none() {
        return SeparationDecision::Bypass("no source separator configured".to_string());
    }
    SeparationDecision::Separate
}

/// Run preflight: configuration check, then optional source separation.
///
/// Configuration errors abort. Separation failures degrade to the raw input.
pub fn run(state: &mut PipelineState, config: &Config) -> Result<()> {
    info!("Pass 0: Preflight");

    validate_config(config)?;

    if state.source.is_empty() || state.source.sample_rate == 0 {
        warn!("input holds no audio; later passes will produce empty results");
    }

    if let SeparationDecision::Bypass(reason) =
        separation_decision(&state.source, config, &state.collaborators)
    {
        info!(%reason, "source separation bypassed");
        state.audio = state.source.clone();
        state.report.skipped(STAGE, reason);
        return Ok(());
    }

    if let Some(separator) = state.collaborators.separator.clone() {
        let name = separator.name().to_string();
        let input = state.source.clone();
        let result = call_with_timeout(&name, state.collaborators.timeout, move || {
            separator.separate(&input)
        });
        match result {
            Ok(stem) if !stem.is_empty() && stem.sample_rate > 0 => {
                info!(duration_s = stem.duration_s(), "using separated percussive stem");
                state.audio = stem;
                state.report.succeeded(STAGE);
            }
            Ok(_) => {
                warn!("separator returned an empty stem; continuing with the raw input");
                state.audio = state.source.clone();
                state.report.degraded(STAGE, "separator returned an empty stem");
            }
            Err(err) => {
                warn!(error = %err, "source separation failed; continuing with the raw input");
                state.audio = state.source.clone();
                state.report.degraded(STAGE, err.to_string());
            }
        }
    }

    Ok(())
}
