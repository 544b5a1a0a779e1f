use anyhow::Context;
use clap::{Parser, Subcommand};
use drumgrid::collaborators::Collaborators;
use drumgrid::config::{load_config, save_config, validate_config};
use drumgrid::manifest::{save_event_grid, PoolManifest};
use drumgrid::{skeleton_from_manifest, validate_input, Config, DrumGrid};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Percussive audio to role pools and event grids
#[derive(Parser)]
#[command(name = "drumgrid")]
#[command(about = "Slice percussive audio into role-tagged sample pools and a skeleton groove")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze audio files and write pools, event grid and reports
    Analyze {
        /// Input WAV files
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Output directory; each input gets a subdirectory named after it
        #[arg(short, long, default_value = "./output")]
        output: PathBuf,

        /// Custom configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// JSON map of hit id to role distribution
        #[arg(long)]
        semantic_scores: Option<PathBuf>,

        /// Apply seeded groove humanization to the skeleton
        #[arg(long)]
        humanize: bool,

        /// Treat inputs as full mixes eligible for source separation
        #[arg(long)]
        full_mix: bool,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,

        /// Quiet output
        #[arg(short, long)]
        quiet: bool,
    },
    /// Generate a new skeleton from a saved pool manifest
    Skeleton {
        /// pools.json written by `analyze`
        pools: PathBuf,

        /// Custom configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[arg(long)]
        bpm: Option<f64>,

        #[arg(long)]
        bars: Option<u32>,

        #[arg(long)]
        seed: Option<u64>,

        /// Where to write the event grid
        #[arg(short, long, default_value = "./event_grid.json")]
        out: PathBuf,
    },
    /// Validate configuration file
    ValidateConfig {
        /// Configuration file to validate
        config: PathBuf,
    },
    /// Show default configuration
    ShowConfig {
        /// Also write it to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default_level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn load_or_default(path: Option<PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => load_config(&path).with_context(|| format!("loading {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn output_dir_for(root: &Path, input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string());
    root.join(stem)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze {
            inputs,
            output,
            config,
            semantic_scores,
            humanize,
            full_mix,
            verbose,
            quiet,
        } => {
            if verbose && quiet {
                anyhow::bail!("Cannot specify both --verbose and --quiet");
            }
            init_tracing(verbose, quiet);

            let mut config = load_or_default(config)?;
            if semantic_scores.is_some() {
                config.collaborators.semantic_scores = semantic_scores;
            }
            config.collaborators.humanize.enabled |= humanize;
            config.audio.full_mix |= full_mix;
            validate_config(&config)?;

            let collaborators = Collaborators::from_config(&config.collaborators)?;
            let processor = DrumGrid::new(config).with_collaborators(collaborators);

            let results: Vec<(PathBuf, drumgrid::Result<drumgrid::PipelineReport>)> = inputs
                .par_iter()
                .map(|input| {
                    let out = output_dir_for(&output, input);
                    let result = validate_input(input, processor.config())
                        .and_then(|_| processor.process(input, &out));
                    (input.clone(), result)
                })
                .collect();

            let mut failures = 0;
            for (input, result) in results {
                match result {
                    Ok(report) if report.is_degraded() => {
                        warn!(input = %input.display(), "finished with degraded stages");
                    }
                    Ok(report) => {
                        info!(
                            input = %input.display(),
                            samples = report.counts.pooled,
                            events = report.counts.events,
                            "finished"
                        );
                    }
                    Err(err) => {
                        error!(input = %input.display(), error = %err, "failed");
                        failures += 1;
                    }
                }
            }
            if failures > 0 {
                anyhow::bail!("{} of {} inputs failed", failures, inputs.len());
            }
            info!(dir = %output.display(), "results saved");
        }
        Commands::Skeleton {
            pools,
            config,
            bpm,
            bars,
            seed,
            out,
        } => {
            init_tracing(false, false);

            let mut config = load_or_default(config)?;
            if let Some(bpm) = bpm {
                config.grid.bpm = bpm;
            }
            if let Some(bars) = bars {
                config.grid.num_bars = bars;
            }
            if let Some(seed) = seed {
                config.skeleton.seed = seed;
            }
            validate_config(&config)?;

            let manifest = PoolManifest::load(&pools)
                .with_context(|| format!("reading pool manifest {}", pools.display()))?;
            for warning in &manifest.warnings {
                warn!("{}", warning);
            }
            let grid = skeleton_from_manifest(&manifest, &config)?;
            save_event_grid(&grid, &out)?;
            info!(events = grid.events.len(), path = %out.display(), "skeleton written");
        }
        Commands::ValidateConfig { config } => {
            let config = load_config(config)?;
            validate_config(&config)?;
            println!("Configuration is valid");
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::ShowConfig { output } => {
            let config = Config::default();
            let json = serde_json::to_string_pretty(&config)?;
            println!("{}", json);
            if let Some(path) = output {
                save_config(&config, &path)?;
            }
        }
    }

    Ok(())
}
