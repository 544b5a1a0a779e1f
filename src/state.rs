//! Pipeline state threaded through the passes

use crate::analysis::{
    Cluster, EventGrid, FeatureOutcome, GridTime, Hit, Onset, PoolReport, Pools, Sample,
    UnscoreableHit,
};
use crate::audio::{load_audio_file, AudioBuffer};
use crate::collaborators::Collaborators;
use crate::error::Result;
use crate::report::PipelineReport;
use std::path::Path;

/// Everything the passes produce for one input.
///
/// Each pass reads the collections of earlier passes and stores a new
/// collection of its own; nothing is mutated after it is written.
#[derive(Debug, Clone)]
pub struct PipelineState {
    /// Audio as loaded
    pub source: AudioBuffer,
    /// Audio the detectors run on (separated stem or the source itself)
    pub audio: AudioBuffer,
    pub collaborators: Collaborators,

    // Pass 1: onset detection
    pub onsets: Vec<Onset>,

    // Pass 2: hit slicing
    pub hits: Vec<Hit>,

    // Pass 3: feature extraction, parallel to `hits`
    pub features: Vec<FeatureOutcome>,

    // Pass 4: deduplication
    pub clusters: Vec<Cluster>,

    // Pass 5: role scoring
    pub samples: Vec<Sample>,
    pub unscoreable: Vec<UnscoreableHit>,

    // Pass 6: pool building
    pub pools: Pools,
    pub pool_report: PoolReport,

    // Pass 7: grid and skeleton
    pub grid: Option<GridTime>,
    pub skeleton: Option<EventGrid>,

    // Pass 8: humanization merge
    pub event_grid: Option<EventGrid>,

    pub report: PipelineReport,
}

impl PipelineState {
    /// Load audio file and create initial state
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let audio = load_audio_file(path)?;
        let mut state = Self::from_buffer(audio);
        state.report.input = Some(path.display().to_string());
        Ok(state)
    }

    /// Create a state from in-memory samples
    pub fn from_samples(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self::from_buffer(AudioBuffer::new(samples, sample_rate))
    }

    pub fn from_buffer(audio: AudioBuffer) -> Self {
        PipelineState {
            source: audio.clone(),
            audio,
            collaborators: Collaborators::default(),
            onsets: Vec::new(),
            hits: Vec::new(),
            features: Vec::new(),
            clusters: Vec::new(),
            samples: Vec::new(),
            unscoreable: Vec::new(),
            pools: Pools::new(),
            pool_report: PoolReport::default(),
            grid: None,
            skeleton: None,
            event_grid: None,
            report: PipelineReport::new(None),
        }
    }

    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    /// Get audio duration in seconds
    pub fn duration_s(&self) -> f32 {
        self.audio.duration_s()
    }
}
