//! End-to-end tests: audio file in, artifacts out

use drumgrid::analysis::{
    DspFeatures, Event, EventGrid, EventSource, GuardFlags, PoolReport, Pools, Role, RoleScores,
    Sample, ScoreBreakdown,
};
use drumgrid::audio::write_wav;
use drumgrid::config::{Config, GridConfig, PoolConfig};
use drumgrid::manifest::{load_event_grid, save_event_grid, PoolManifest};
use drumgrid::midi::event_grid_to_midi;
use drumgrid::passes::pass_7::{generate_skeleton, grid_time};
use drumgrid::report::{PipelineReport, StageStatus};
use drumgrid::{skeleton_from_manifest, DrumGrid, LOAD_STAGE};
use std::f32::consts::PI;
use std::path::Path;
use tempfile::TempDir;

const SR: u32 = 16000;

/// Sixteen identical 1.5 kHz clicks, 0.5 s apart
fn click_track() -> Vec<f32> {
    let template: Vec<f32> = (0..(0.25 * SR as f32) as usize)
        .map(|i| {
            let t = i as f32 / SR as f32;
            (2.0 * PI * 1500.0 * t).sin() * (-t / 0.02).exp() * 0.8
        })
        .collect();
    let mut audio = vec![0.0; SR as usize * 8];
    for k in 0..16 {
        let start = ((0.1 + 0.5 * k as f32) * SR as f32).round() as usize;
        audio[start..start + template.len()].copy_from_slice(&template);
    }
    audio
}

fn sample(id: &str, role: Role, energy: f32, decay: f32) -> Sample {
    let mut raw = [0.05f32; 5];
    raw[role.index()] = 0.8;
    let scores = RoleScores(raw).normalized();
    Sample {
        id: id.to_string(),
        hit_id: id.to_string(),
        role,
        cluster_size: 2,
        features: DspFeatures {
            energy,
            decay_time: decay,
            low_ratio: 0.5,
            mid_ratio: 0.3,
            high_ratio: 0.2,
            ..DspFeatures::default()
        },
        scores: ScoreBreakdown {
            rule: scores,
            external: None,
            fused: scores,
            guarded: scores,
        },
        guards: GuardFlags::default(),
        audio: Vec::new(),
        sample_rate: SR,
    }
}

fn pools() -> Pools {
    let mut pools = Pools::new();
    pools.push(Role::Core, sample("hit_000", Role::Core, 0.71, 0.09));
    pools.push(Role::Accent, sample("hit_003", Role::Accent, 0.55, 0.12));
    pools.push(Role::Motion, sample("hit_005", Role::Motion, 0.23, 0.02));
    pools.push(Role::Fill, sample("hit_009", Role::Fill, 0.66, 0.31));
    pools.push(Role::Texture, sample("hit_012", Role::Texture, 0.17, 0.58));
    pools
}

fn tuples(grid: &EventGrid) -> Vec<(u32, u32, Role, String, f32, u32)> {
    grid.events
        .iter()
        .map(|e| (e.bar, e.step, e.role, e.sample_id.clone(), e.velocity, e.duration_steps))
        .collect()
}

fn saved_report(dir: &Path) -> PipelineReport {
    let json = std::fs::read_to_string(dir.join("pipeline_report.json")).unwrap();
    serde_json::from_str(&json).unwrap()
}

fn write_input(dir: &Path, name: &str, samples: &[f32]) -> std::path::PathBuf {
    let path = dir.join(name);
    write_wav(&path, samples, SR).unwrap();
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_click_track_end_to_end() {
        let dir = TempDir::new().unwrap();
        let input = write_input(dir.path(), "clicks.wav", &click_track());
        let out = dir.path().join("out");

        let report = DrumGrid::new(Config::default()).process(&input, &out).unwrap();

        let stages: Vec<&str> = report.stages.iter().map(|s| s.stage.as_str()).collect();
        assert_eq!(
            stages,
            vec!["preflight", "onsets", "slicing", "features", "dedup", "scoring", "pools", "skeleton", "humanize"]
        );
        assert_eq!(report.counts.onsets, 16);
        assert_eq!(report.counts.hits, 16);
        assert_eq!(report.counts.clusters, 1);
        assert_eq!(report.counts.samples, 1);

        for file in ["pools.json", "event_grid.json", "samples_report.json", "pipeline_report.json"] {
            assert!(out.join(file).exists(), "missing {}", file);
        }

        let manifest = PoolManifest::load(out.join("pools.json")).unwrap();
        let grid = load_event_grid(out.join("event_grid.json")).unwrap();
        assert!(manifest.unresolved(&grid).is_empty());
        for listing in &manifest.pools {
            for entry in &listing.samples {
                assert!(out.join(&entry.file).exists(), "missing {}", entry.file);
            }
        }
        assert_eq!(out.join("event_grid.mid").exists(), !grid.events.is_empty());

        assert_eq!(saved_report(&out), report);
    }

    #[test]
    fn test_silent_file_gives_empty_valid_result() {
        let dir = TempDir::new().unwrap();
        let input = write_input(dir.path(), "silence.wav", &vec![0.0; SR as usize * 2]);
        let out = dir.path().join("out");

        let report = DrumGrid::new(Config::default()).process(&input, &out).unwrap();
        assert_eq!(report.counts.onsets, 0);
        assert_eq!(report.counts.events, 0);
        assert_eq!(report.insufficient_pools.len(), 3);
        assert!(report.is_degraded());

        let grid = load_event_grid(out.join("event_grid.json")).unwrap();
        assert!(grid.events.is_empty());
        assert!(!out.join("event_grid.mid").exists());
    }

    #[test]
    fn test_event_grid_round_trip() {
        let dir = TempDir::new().unwrap();
        let grid = generate_skeleton(
            &pools(),
            &grid_time(&GridConfig::default()).unwrap(),
            &Config::default().skeleton,
        );
        let path = dir.path().join("event_grid.json");
        save_event_grid(&grid, &path).unwrap();
        let loaded = load_event_grid(&path).unwrap();

        assert_eq!(tuples(&loaded), tuples(&grid));
        assert_eq!(loaded.grid, grid.grid);
    }

    #[test]
    fn test_user_edited_grid_loads_without_offsets() {
        let json = r#"{
            "grid": { "bpm": 100.0, "meter_numerator": 4, "meter_denominator": 4, "steps_per_bar": 16, "num_bars": 1 },
            "events": [
                { "bar": 0, "step": 8, "role": "ACCENT", "sample_id": "hit_003",
                  "velocity": 0.9, "duration_steps": 1, "source": "user_edit" }
            ]
        }"#;
        let grid: EventGrid = serde_json::from_str(json).unwrap();
        assert_eq!(grid.events[0].source, EventSource::UserEdit);
        assert_eq!(grid.events[0].micro_offset_ms, 0.0);
        assert_eq!(grid.events[0].role, Role::Accent);
    }

    #[test]
    fn test_manifest_reproduces_skeleton() {
        let dir = TempDir::new().unwrap();
        let config = Config::default();
        let pools = pools();
        let manifest = PoolManifest::from_pools(&pools, &PoolReport::default(), &PoolConfig::default());
        let path = dir.path().join("pools.json");
        manifest.save(&path).unwrap();
        let reloaded = PoolManifest::load(&path).unwrap();

        let direct = generate_skeleton(&pools, &grid_time(&config.grid).unwrap(), &config.skeleton);
        let from_file = skeleton_from_manifest(&reloaded, &config).unwrap();
        assert_eq!(
            serde_json::to_string(&direct).unwrap(),
            serde_json::to_string(&from_file).unwrap()
        );
        assert!(reloaded.unresolved(&from_file).is_empty());
    }

    #[test]
    fn test_midi_bytes() {
        let grid = EventGrid {
            grid: GridConfig::default(),
            events: vec![Event {
                bar: 0,
                step: 4,
                role: Role::Core,
                sample_id: "hit_000".into(),
                velocity: 1.0,
                duration_steps: 1,
                micro_offset_ms: 0.0,
                source: EventSource::Skeleton,
            }],
        };
        let bytes = event_grid_to_midi(&grid, 960).unwrap();
        assert_eq!(&bytes[..4], b"MThd");
        // format 0, one track, 960 ticks per quarter
        assert_eq!(&bytes[8..14], &[0, 0, 0, 1, 0x03, 0xC0]);
        let note_on = bytes.windows(3).any(|w| w == [0x99, 36, 127]);
        assert!(note_on, "no note-on for CORE on channel 10");
    }

    #[test]
    fn test_fatal_stage_still_writes_report() {
        let dir = TempDir::new().unwrap();
        let input = write_input(dir.path(), "clicks.wav", &click_track());
        let out = dir.path().join("out");
        let mut config = Config::default();
        config.grid.steps_per_bar = 0;

        assert!(DrumGrid::new(config).process(&input, &out).is_err());

        let report = saved_report(&out);
        assert_eq!(report.stages.len(), 1);
        assert_eq!(report.status_of("preflight"), Some(StageStatus::Failed));
        let reason = report.stage("preflight").and_then(|r| r.reason.clone()).unwrap();
        assert!(reason.contains("steps_per_bar"), "{}", reason);
        assert!(!out.join("event_grid.json").exists());
    }

    #[test]
    fn test_unreadable_input_still_writes_report() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out");

        let result = DrumGrid::new(Config::default()).process(dir.path().join("missing.wav"), &out);
        assert!(result.is_err());

        let report = saved_report(&out);
        assert_eq!(report.status_of(LOAD_STAGE), Some(StageStatus::Failed));
        assert!(report.is_degraded());
    }
}
