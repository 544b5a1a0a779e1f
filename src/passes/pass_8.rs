//! Pass 8: Humanization Merge

use crate::analysis::{sort_events, EventGrid, EventSource, Pools, Role};
use crate::collaborators::call_with_timeout;
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::passes::pass_7::resolve_polyphony;
use crate::state::PipelineState;
use std::collections::HashMap;
use tracing::{info, warn};

pub const STAGE: &str = "humanize";

/// Check a humanizer's output against the skeleton it was given.
///
/// Only timing offsets and velocities may change. Every event must sit on a
/// `(bar, step, role)` placement the skeleton holds, at most as many times as
/// the skeleton holds it, and play a sample from that role's pool. Events may
/// be dropped but never added.
pub fn validate_humanized(candidate: &EventGrid, skeleton: &EventGrid, pools: &Pools) -> Result<()> {
    let reject = |reason: String| Err(PipelineError::collaborator("humanizer", reason));

    if candidate.grid != skeleton.grid {
        return reject("grid configuration changed".to_string());
    }

    let grid = &skeleton.grid;
    let step_ms = 60_000.0 / grid.bpm * grid.meter_numerator as f64 / grid.steps_per_bar as f64;
    let max_offset_ms = (step_ms / 2.0) as f32;

    let mut placements: HashMap<(u32, u32, Role), usize> = HashMap::new();
    for event in &skeleton.events {
        *placements.entry((event.bar, event.step, event.role)).or_default() += 1;
    }

    for event in &candidate.events {
        let at = format!("bar {} step {}", event.bar, event.step);
        if event.bar >= grid.num_bars || event.step >= grid.steps_per_bar {
            return reject(format!("{} lies outside the grid", at));
        }
        match placements.get_mut(&(event.bar, event.step, event.role)) {
            Some(left) if *left > 0 => *left -= 1,
            _ => return reject(format!("{} {} is not a skeleton placement", at, event.role)),
        }
        if pools.find(&event.sample_id).is_none() {
            return reject(format!("{} references unknown sample {}", at, event.sample_id));
        }
        if !pools.get(event.role).iter().any(|s| s.id == event.sample_id) {
            return reject(format!(
                "{} plays {} from outside the {} pool",
                at, event.sample_id, event.role
            ));
        }
        if !(0.0..=1.0).contains(&event.velocity) {
            return reject(format!("{} has velocity {}", at, event.velocity));
        }
        if event.duration_steps == 0 {
            return reject(format!("{} has zero duration", at));
        }
        if !event.micro_offset_ms.is_finite() || event.micro_offset_ms.abs() >= max_offset_ms {
            return reject(format!(
                "{} offset {:.2} ms exceeds half a step ({:.2} ms)",
                at, event.micro_offset_ms, max_offset_ms
            ));
        }
    }
    Ok(())
}

pub fn run(state: &mut PipelineState, config: &Config) -> Result<()> {
    info!("Pass 8: Humanization");

    let Some(skeleton) = state.skeleton.clone() else {
        state.report.skipped(STAGE, "no skeleton to humanize");
        return Ok(());
    };

    let Some(humanizer) = state.collaborators.humanizer.clone() else {
        state.report.skipped(STAGE, "no humanizer configured");
        state.event_grid = Some(skeleton);
        return Ok(());
    };

    let name = humanizer.name().to_string();
    let input = skeleton.clone();
    let result = call_with_timeout(&name, state.collaborators.timeout, move || {
        humanizer.humanize(&input)
    })
    .and_then(|candidate| {
        validate_humanized(&candidate, &skeleton, &state.pools)?;
        Ok(candidate)
    });

    let final_grid = match result {
        Ok(candidate) => {
            let mut events = resolve_polyphony(candidate.events, config.skeleton.max_poly);
            for event in &mut events {
                event.source = EventSource::Humanized;
            }
            sort_events(&mut events);
            state.report.succeeded(STAGE);
            EventGrid {
                grid: candidate.grid,
                events,
            }
        }
        Err(err) => {
            warn!(error = %err, "humanization rejected; keeping the skeleton");
            state.report.degraded(STAGE, err.to_string());
            skeleton
        }
    };

    state.report.counts.events = final_grid.events.len();
    info!(events = final_grid.events.len(), "event grid ready");
    state.event_grid = Some(final_grid);
    Ok(())
}
