//! Persisted artifacts: pool manifest, event grid, per-sample report and
//! sample audio

use crate::analysis::{
    DspFeatures, EventGrid, GuardFlags, PoolReport, Pools, Role, RoleScores, Sample,
    ScoreBreakdown, UnscoreableHit,
};
use crate::audio::write_wav;
use crate::config::PoolConfig;
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

/// Directory under the output root holding one WAV per pooled sample
pub const SAMPLES_DIR: &str = "samples";

/// One pooled sample as seen by downstream consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub sample_id: String,
    /// Path of the sample audio relative to the output directory
    pub file: String,
    pub role: Role,
    pub confidence: f32,
    pub margin: f32,
    pub final_scores: RoleScores,
    pub features: DspFeatures,
    pub cluster_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolListing {
    pub role: Role,
    pub min_size: usize,
    pub max_size: usize,
    pub samples: Vec<ManifestEntry>,
}

/// Contents of `pools.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolManifest {
    pub version: String,
    pub pools: Vec<PoolListing>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl PoolManifest {
    pub fn from_pools(pools: &Pools, report: &PoolReport, cfg: &PoolConfig) -> Self {
        let listings = pools
            .iter()
            .map(|(role, members)| PoolListing {
                role,
                min_size: cfg.min_for(role),
                max_size: cfg.max_for(role),
                samples: members
                    .iter()
                    .map(|s| ManifestEntry {
                        sample_id: s.id.clone(),
                        file: format!("{}/{}.wav", SAMPLES_DIR, s.id),
                        role,
                        confidence: s.confidence(),
                        margin: s.margin(),
                        final_scores: *s.final_scores(),
                        features: s.features,
                        cluster_size: s.cluster_size,
                    })
                    .collect(),
            })
            .collect();

        let warnings = report
            .insufficient
            .iter()
            .map(|s| {
                PipelineError::InsufficientPool {
                    role: s.role,
                    size: s.size,
                    min_size: s.min_size,
                }
                .to_string()
            })
            .collect();

        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            pools: listings,
            warnings,
        }
    }

    /// Rebuild pools without audio; every score stage is the final distribution
    pub fn to_pools(&self) -> Pools {
        let mut pools = Pools::new();
        for listing in &self.pools {
            for entry in &listing.samples {
                let scores = ScoreBreakdown {
                    rule: entry.final_scores,
                    external: None,
                    fused: entry.final_scores,
                    guarded: entry.final_scores,
                };
                pools.push(
                    listing.role,
                    Sample {
                        id: entry.sample_id.clone(),
                        hit_id: entry.sample_id.clone(),
                        role: listing.role,
                        cluster_size: entry.cluster_size,
                        features: entry.features,
                        scores,
                        guards: GuardFlags::default(),
                        audio: Vec::new(),
                        sample_rate: 0,
                    },
                );
            }
        }
        pools
    }

    pub fn sample_ids(&self) -> HashSet<&str> {
        self.pools
            .iter()
            .flat_map(|l| l.samples.iter().map(|e| e.sample_id.as_str()))
            .collect()
    }

    /// Ids referenced by `grid` that the manifest cannot resolve
    pub fn unresolved<'a>(&self, grid: &'a EventGrid) -> Vec<&'a str> {
        let ids = self.sample_ids();
        grid.events
            .iter()
            .map(|e| e.sample_id.as_str())
            .filter(|id| !ids.contains(id))
            .collect()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_json(self, path.as_ref())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Per-sample scoring trail, contents of `samples_report.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub sample_id: String,
    pub role: Role,
    pub cluster_size: usize,
    pub features: DspFeatures,
    pub rule_scores: RoleScores,
    pub external_scores: Option<RoleScores>,
    pub fused_scores: RoleScores,
    pub final_scores: RoleScores,
    pub guards: GuardFlags,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplesReport {
    pub samples: Vec<SampleRecord>,
    pub unscoreable: Vec<UnscoreableHit>,
}

impl SamplesReport {
    /// Records keep the role decided by scoring, before any pool moves
    pub fn new(samples: &[Sample], unscoreable: &[UnscoreableHit]) -> Self {
        Self {
            samples: samples
                .iter()
                .map(|s| SampleRecord {
                    sample_id: s.id.clone(),
                    role: s.role,
                    cluster_size: s.cluster_size,
                    features: s.features,
                    rule_scores: s.scores.rule,
                    external_scores: s.scores.external,
                    fused_scores: s.scores.fused,
                    final_scores: s.scores.guarded,
                    guards: s.guards,
                })
                .collect(),
            unscoreable: unscoreable.to_vec(),
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_json(self, path.as_ref())
    }
}

pub fn save_event_grid<P: AsRef<Path>>(grid: &EventGrid, path: P) -> Result<()> {
    write_json(grid, path.as_ref())
}

pub fn load_event_grid<P: AsRef<Path>>(path: P) -> Result<EventGrid> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Write each pooled sample's audio as `samples/<sample_id>.wav`
pub fn export_sample_audio(pools: &Pools, output_dir: &Path) -> Result<usize> {
    let dir = output_dir.join(SAMPLES_DIR);
    std::fs::create_dir_all(&dir)?;

    let mut written = 0;
    for (_, members) in pools.iter() {
        for sample in members.iter().filter(|s| !s.audio.is_empty() && s.sample_rate > 0) {
            let path = dir.join(format!("{}.wav", sample.id));
            write_wav(&path, &sample.audio, sample.sample_rate)?;
            debug!(path = %path.display(), "wrote sample");
            written += 1;
        }
    }
    info!(written, dir = %dir.display(), "exported sample audio");
    Ok(written)
}

fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)?;
    debug!(path = %path.display(), "wrote json");
    Ok(())
}
