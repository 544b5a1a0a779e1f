//! Pass 7: Grid Scheduling and Skeleton Generation

use crate::analysis::{sort_events, Event, EventGrid, EventSource, GridTime, Pools, Role, Sample};
use crate::config::{fill_patterns, validate_grid, Config, FillMode, GridConfig, SkeletonConfig, VelocityCurve};
use crate::error::Result;
use crate::state::PipelineState;
use rand::distributions::WeightedIndex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const STAGE: &str = "skeleton";

/// Derive beat, bar and step durations plus the absolute time of every cell
pub fn grid_time(grid: &GridConfig) -> Result<GridTime> {
    validate_grid(grid)?;

    let seconds_per_beat = 60.0 / grid.bpm;
    let seconds_per_bar = grid.meter_numerator as f64 * seconds_per_beat;
    let seconds_per_step = seconds_per_bar / grid.steps_per_bar as f64;

    let step_times = (0..grid.num_bars)
        .map(|bar| {
            (0..grid.steps_per_bar)
                .map(|step| bar as f64 * seconds_per_bar + step as f64 * seconds_per_step)
                .collect()
        })
        .collect();

    Ok(GridTime {
        config: grid.clone(),
        seconds_per_beat,
        seconds_per_bar,
        seconds_per_step,
        step_times,
    })
}

pub fn velocity_for(curve: VelocityCurve, energy: f32) -> f32 {
    (curve.intercept + curve.slope * energy).clamp(0.0, 1.0)
}

/// TEXTURE holds for the bar; ringing hits get two steps
pub fn duration_for(role: Role, decay_time: f32, grid: &GridTime, cfg: &SkeletonConfig) -> u32 {
    if role == Role::Texture {
        return grid.config.steps_per_bar;
    }
    if decay_time as f64 > cfg.long_decay_step_ratio as f64 * grid.seconds_per_step {
        2
    } else {
        1
    }
}

/// Keep at most `max_poly` events per cell, dropping the lowest priority first
pub fn resolve_polyphony(events: Vec<Event>, max_poly: usize) -> Vec<Event> {
    let mut cells: BTreeMap<(u32, u32), Vec<Event>> = BTreeMap::new();
    for event in events {
        cells.entry((event.bar, event.step)).or_default().push(event);
    }

    let mut kept = Vec::new();
    for ((bar, step), mut cell) in cells {
        sort_events(&mut cell);
        if cell.len() > max_poly {
            let dropped: Vec<Role> = cell[max_poly..].iter().map(|e| e.role).collect();
            debug!(bar, step, ?dropped, "polyphony limit");
            cell.truncate(max_poly);
        }
        kept.extend(cell);
    }
    sort_events(&mut kept);
    kept
}

/// Steps of a pattern that fit inside the bar
fn in_bar(steps: &[u32], steps_per_bar: u32) -> Vec<u32> {
    steps.iter().copied().filter(|&s| s < steps_per_bar).collect()
}

/// Steps one fill occupies, drawn from `rng` according to `cfg.fill_mode`
fn fill_shape(window: &[u32], cfg: &SkeletonConfig, rng: &mut StdRng) -> Vec<u32> {
    if cfg.fill_mode == FillMode::Patterns {
        let shapes = fill_patterns(window);
        let weights: Vec<f64> = if cfg.fill_pattern_weights.len() == shapes.len() {
            cfg.fill_pattern_weights.clone()
        } else {
            vec![1.0; shapes.len()]
        };
        if let Ok(index) = WeightedIndex::new(&weights) {
            return shapes[rng.sample(index)].clone();
        }
    }
    let count = rng.gen_range(1..=cfg.fill_max_events.clamp(1, window.len()));
    window.choose_multiple(rng, count).copied().collect()
}

/// Place pooled samples on the fixed role patterns.
///
/// All randomness comes from one `StdRng` seeded with `cfg.seed`, and draws
/// happen in a fixed order, so equal inputs give equal grids.
pub fn generate_skeleton(pools: &Pools, grid: &GridTime, cfg: &SkeletonConfig) -> EventGrid {
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let steps_per_bar = grid.config.steps_per_bar;

    let core = pools.get(Role::Core).choose(&mut rng);
    let accent = pools.get(Role::Accent).choose(&mut rng);
    let motion: Vec<&Sample> = pools
        .get(Role::Motion)
        .iter()
        .take(cfg.motion_max_samples.max(1))
        .collect();
    let fill = pools.get(Role::Fill).choose(&mut rng);
    let texture = pools.get(Role::Texture).choose(&mut rng);

    let event = |sample: &Sample, role: Role, bar: u32, step: u32| Event {
        bar,
        step,
        role,
        sample_id: sample.id.clone(),
        velocity: velocity_for(cfg.velocity.for_role(role), sample.features.energy),
        duration_steps: duration_for(role, sample.features.decay_time, grid, cfg),
        micro_offset_ms: 0.0,
        source: EventSource::Skeleton,
    };

    let (core_pattern, accent_pattern) = cfg.core_accent_steps();
    let core_steps = in_bar(&core_pattern, steps_per_bar);
    let accent_steps = in_bar(&accent_pattern, steps_per_bar);
    let mandatory = in_bar(&cfg.motion_mandatory_steps, steps_per_bar);
    let secondary: Vec<u32> = in_bar(&cfg.motion_secondary_steps, steps_per_bar)
        .into_iter()
        .filter(|s| !mandatory.contains(s))
        .collect();
    let fill_steps = in_bar(&cfg.fill_steps, steps_per_bar);

    let mut events = Vec::new();
    let mut motion_turn = 0usize;

    for bar in 0..grid.config.num_bars {
        if let Some(sample) = core {
            events.extend(core_steps.iter().map(|&s| event(sample, Role::Core, bar, s)));
        }

        if let Some(sample) = accent {
            events.extend(accent_steps.iter().map(|&s| event(sample, Role::Accent, bar, s)));
        }

        if !motion.is_empty() {
            let extra = cfg.motion_per_bar.saturating_sub(mandatory.len());
            let mut steps = mandatory.clone();
            steps.extend(secondary.choose_multiple(&mut rng, extra).copied());
            steps.sort_unstable();
            for step in steps {
                let sample = motion[motion_turn % motion.len()];
                motion_turn += 1;
                events.push(event(sample, Role::Motion, bar, step));
            }
        }

        let fill_bar = cfg.fill_every_n_bars > 0 && (bar + 1) % cfg.fill_every_n_bars == 0;
        if let (Some(sample), true) = (fill, fill_bar && !fill_steps.is_empty()) {
            if rng.gen::<f64>() < cfg.fill_prob {
                let mut steps = fill_shape(&fill_steps, cfg, &mut rng);
                steps.sort_unstable();
                debug!(bar, ?steps, "fill");
                events.extend(steps.into_iter().map(|s| event(sample, Role::Fill, bar, s)));
            }
        }

        if let (Some(sample), true) = (texture, cfg.texture_enabled) {
            events.push(event(sample, Role::Texture, bar, 0));
        }
    }

    EventGrid {
        grid: grid.config.clone(),
        events: resolve_polyphony(events, cfg.max_poly),
    }
}

pub fn run(state: &mut PipelineState, config: &Config) -> Result<()> {
    info!("Pass 7: Grid Scheduling and Skeleton");

    let grid = grid_time(&config.grid)?;
    debug!(
        seconds_per_bar = grid.seconds_per_bar,
        seconds_per_step = grid.seconds_per_step,
        "grid"
    );

    let skeleton = generate_skeleton(&state.pools, &grid, &config.skeleton);
    for role in Role::ALL {
        if state.pools.len(role) == 0 {
            debug!(%role, "empty pool, no events");
        }
    }

    state.report.counts.events = skeleton.events.len();
    state.report.succeeded(STAGE);
    info!(
        events = skeleton.events.len(),
        bars = grid.config.num_bars,
        bpm = grid.config.bpm,
        "skeleton generated"
    );

    state.grid = Some(grid);
    state.skeleton = Some(skeleton);
    Ok(())
}
