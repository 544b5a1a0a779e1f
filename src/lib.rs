//! Percussive audio to role-tagged sample pools and a rhythmic event grid
//!
//! A deterministic signal-processing pipeline: onsets are detected and sliced
//! into hits, near-duplicate hits are merged, each remaining sample is scored
//! into one of five rhythmic roles, and a seeded skeleton groove is laid out
//! on a bar/step grid from the resulting pools.

pub mod analysis;
pub mod audio;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod manifest;
pub mod midi;
pub mod passes;
pub mod report;
pub mod spectral;
pub mod state;

pub use analysis::{Event, EventGrid, Role, RoleScores, Sample};
pub use collaborators::Collaborators;
pub use config::Config;
pub use error::{PipelineError, Result};
pub use report::PipelineReport;
pub use state::PipelineState;

use manifest::{PoolManifest, SamplesReport};
use std::path::Path;
use tracing::{error, info, warn};

/// Main processing pipeline for percussive audio
pub struct DrumGrid {
    config: Config,
    collaborators: Collaborators,
}

impl DrumGrid {
    /// Create a new processor with the given configuration
    pub fn new(config: Config) -> Self {
        Self {
            config,
            collaborators: Collaborators::default(),
        }
    }

    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Process an audio file and write every artifact to `output_dir`.
    ///
    /// When loading or a pass fails, the pipeline report is still written
    /// with a `failed` record for that stage before the error is returned.
    pub fn process<P: AsRef<Path>, Q: AsRef<Path>>(&self, input_path: P, output_dir: Q) -> Result<PipelineReport> {
        let input_path = input_path.as_ref();
        let output_dir = output_dir.as_ref();

        let mut state = match PipelineState::load(input_path) {
            Ok(state) => state.with_collaborators(self.collaborators.clone()),
            Err(err) => {
                let mut report = PipelineReport::new(Some(input_path.display().to_string()));
                report.failed(LOAD_STAGE, err.to_string());
                write_failure_report(&report, output_dir);
                return Err(err);
            }
        };

        if let Err(err) = self.run_pipeline(&mut state) {
            write_failure_report(&state.report, output_dir);
            return Err(err);
        }
        self.export_results(&state, output_dir)?;
        Ok(state.report)
    }

    /// Execute the complete multi-pass pipeline, recording the failing stage
    pub fn run_pipeline(&self, state: &mut PipelineState) -> Result<()> {
        for (stage, run) in PASSES {
            if let Err(err) = run(state, &self.config) {
                error!(stage, error = %err, "pass failed");
                state.report.failed(stage, err.to_string());
                return Err(err);
            }
        }
        Ok(())
    }

    /// Write the manifest, event grid, reports, sample audio and MIDI
    pub fn export_results(&self, state: &PipelineState, output_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(output_dir)?;

        PoolManifest::from_pools(&state.pools, &state.pool_report, &self.config.pools)
            .save(output_dir.join("pools.json"))?;
        SamplesReport::new(&state.samples, &state.unscoreable)
            .save(output_dir.join("samples_report.json"))?;

        if let Some(grid) = &state.event_grid {
            manifest::save_event_grid(grid, output_dir.join("event_grid.json"))?;
            if self.config.export.write_midi {
                midi::export_midi(grid, output_dir, self.config.export.midi_ppq)?;
            }
        }
        if self.config.export.write_samples {
            manifest::export_sample_audio(&state.pools, output_dir)?;
        }

        report::export_report(&state.report, output_dir)?;
        info!(dir = %output_dir.display(), "results written");
        Ok(())
    }
}

/// Report stage name for reading the input file
pub const LOAD_STAGE: &str = "load";

type Pass = fn(&mut PipelineState, &Config) -> Result<()>;

/// Passes in execution order
const PASSES: [(&str, Pass); 9] = [
    (passes::pass_0::STAGE, passes::pass_0::run),
    (passes::pass_1::STAGE, passes::pass_1::run),
    (passes::pass_2::STAGE, passes::pass_2::run),
    (passes::pass_3::STAGE, passes::pass_3::run),
    (passes::pass_4::STAGE, passes::pass_4::run),
    (passes::pass_5::STAGE, passes::pass_5::run),
    (passes::pass_6::STAGE, passes::pass_6::run),
    (passes::pass_7::STAGE, passes::pass_7::run),
    (passes::pass_8::STAGE, passes::pass_8::run),
];

/// Best effort: the original error is what the caller sees
fn write_failure_report(report: &PipelineReport, output_dir: &Path) {
    if let Err(err) = report::export_report(report, output_dir) {
        warn!(error = %err, "could not write the pipeline report");
    }
}

/// Lay out a new skeleton from a saved pool manifest
pub fn skeleton_from_manifest(manifest: &PoolManifest, config: &Config) -> Result<EventGrid> {
    let grid = passes::pass_7::grid_time(&config.grid)?;
    Ok(passes::pass_7::generate_skeleton(&manifest.to_pools(), &grid, &config.skeleton))
}

/// Validate configuration and input files
pub fn validate_input<P: AsRef<Path>>(input_path: P, config: &Config) -> Result<()> {
    audio::validate_audio_file(input_path)?;
    config::validate_config(config)?;
    Ok(())
}
