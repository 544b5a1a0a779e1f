//! Boundary to external collaborators: source separation, semantic scoring
//! and humanization.
//!
//! Every call goes through [`call_with_timeout`]; a timeout or error is
//! reported as [`PipelineError::ExternalCollaboratorFailure`] and the calling
//! pass falls back to its local result.

use crate::analysis::{EventGrid, Hit, RoleScores};
use crate::audio::AudioBuffer;
use crate::config::{CollaboratorConfig, HumanizeConfig};
use crate::error::{PipelineError, Result};
use crossbeam_channel::{bounded, RecvTimeoutError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Splits the percussive stem out of a full mix
pub trait SourceSeparator: Send + Sync {
    fn name(&self) -> &str {
        "source_separator"
    }

    fn separate(&self, audio: &AudioBuffer) -> Result<AudioBuffer>;
}

/// Supplies a role distribution for a hit from outside the rule model
pub trait SemanticScorer: Send + Sync {
    fn name(&self) -> &str {
        "semantic_scorer"
    }

    fn score(&self, hit: &Hit) -> Result<RoleScores>;
}

/// Produces a humanized variant of a skeleton grid
pub trait Humanizer: Send + Sync {
    fn name(&self) -> &str {
        "humanizer"
    }

    fn humanize(&self, grid: &EventGrid) -> Result<EventGrid>;
}

/// Optional collaborators handed to the pipeline
#[derive(Clone)]
pub struct Collaborators {
    pub separator: Option<Arc<dyn SourceSeparator>>,
    pub scorer: Option<Arc<dyn SemanticScorer>>,
    pub humanizer: Option<Arc<dyn Humanizer>>,
    pub timeout: Duration,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            separator: None,
            scorer: None,
            humanizer: None,
            timeout: Duration::from_millis(CollaboratorConfig::default().timeout_ms),
        }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("separator", &self.separator.as_ref().map(|s| s.name().to_string()))
            .field("scorer", &self.scorer.as_ref().map(|s| s.name().to_string()))
            .field("humanizer", &self.humanizer.as_ref().map(|h| h.name().to_string()))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Collaborators {
    /// Build the file-backed collaborators named in the configuration
    pub fn from_config(config: &CollaboratorConfig) -> Result<Self> {
        let mut collaborators = Collaborators {
            timeout: Duration::from_millis(config.timeout_ms),
            ..Default::default()
        };
        if let Some(path) = &config.semantic_scores {
            collaborators.scorer = Some(Arc::new(PrecomputedScores::load(path)?));
        }
        if config.humanize.enabled {
            collaborators.humanizer = Some(Arc::new(GrooveHumanizer::new(&config.humanize)));
        }
        Ok(collaborators)
    }

    pub fn with_separator(mut self, separator: Arc<dyn SourceSeparator>) -> Self {
        self.separator = Some(separator);
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn SemanticScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn with_humanizer(mut self, humanizer: Arc<dyn Humanizer>) -> Self {
        self.humanizer = Some(humanizer);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Run `job` on a worker thread and wait at most `timeout` for its result.
///
/// A job that overruns is left to finish on its own; its result is dropped.
pub fn call_with_timeout<T, F>(name: &str, timeout: Duration, job: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (tx, rx) = bounded(1);
    thread::Builder::new()
        .name(format!("collab-{}", name))
        .spawn(move || {
            let _ = tx.send(job());
        })
        .map_err(|e| PipelineError::collaborator(name, format!("failed to spawn worker: {}", e)))?;

    match rx.recv_timeout(timeout) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err @ PipelineError::ExternalCollaboratorFailure { .. })) => Err(err),
        Ok(Err(err)) => Err(PipelineError::collaborator(name, err.to_string())),
        Err(RecvTimeoutError::Timeout) => Err(PipelineError::collaborator(
            name,
            format!("timed out after {} ms", timeout.as_millis()),
        )),
        Err(RecvTimeoutError::Disconnected) => {
            Err(PipelineError::collaborator(name, "worker exited without a result"))
        }
    }
}

/// Semantic scores computed offline, keyed by hit id
#[derive(Debug, Clone, Default)]
pub struct PrecomputedScores {
    scores: HashMap<String, RoleScores>,
}

impl PrecomputedScores {
    pub fn new(scores: HashMap<String, RoleScores>) -> Self {
        Self { scores }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let scores: HashMap<String, RoleScores> = serde_json::from_str(&content)?;
        Ok(Self { scores })
    }
}

impl SemanticScorer for PrecomputedScores {
    fn name(&self) -> &str {
        "precomputed_scores"
    }

    fn score(&self, hit: &Hit) -> Result<RoleScores> {
        self.scores
            .get(&hit.id)
            .copied()
            .ok_or_else(|| PipelineError::collaborator(self.name(), format!("no scores for {}", hit.id)))
    }
}

/// Seeded micro-timing and velocity jitter
#[derive(Debug, Clone)]
pub struct GrooveHumanizer {
    seed: u64,
    timing_ms: f32,
    velocity_jitter: f32,
}

impl GrooveHumanizer {
    pub fn new(config: &HumanizeConfig) -> Self {
        Self {
            seed: config.seed,
            timing_ms: config.timing_ms.abs(),
            velocity_jitter: config.velocity_jitter.abs(),
        }
    }
}

impl Humanizer for GrooveHumanizer {
    fn name(&self) -> &str {
        "groove_humanizer"
    }

    fn humanize(&self, grid: &EventGrid) -> Result<EventGrid> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut out = grid.clone();
        for event in &mut out.events {
            let time_offset = if self.timing_ms > 0.0 {
                rng.gen_range(-self.timing_ms..=self.timing_ms)
            } else {
                0.0
            };
            let vel_offset = if self.velocity_jitter > 0.0 {
                rng.gen_range(-self.velocity_jitter..=self.velocity_jitter)
            } else {
                0.0
            };
            event.micro_offset_ms += time_offset;
            event.velocity = (event.velocity + vel_offset).clamp(0.0, 1.0);
        }
        Ok(out)
    }
}
