//! Error types for the drumgrid pipeline

use crate::analysis::Role;
use thiserror::Error;

/// Errors raised while turning audio into pools and event grids.
///
/// Only [`PipelineError::Configuration`] aborts a run before processing
/// starts. The collaborator, pool and guard variants are recorded in the
/// pipeline report and the run degrades around them.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// E001: audio too short, silent or otherwise unusable
    #[error("E001: Invalid input - {0}")]
    InvalidInput(String),

    /// E002: a required role pool could not reach its minimum size
    #[error("E002: Insufficient pool for {role} ({size} < {min_size})")]
    InsufficientPool {
        role: Role,
        size: usize,
        min_size: usize,
    },

    /// E003: guard rails overturned a confident fused decision
    #[error("E003: Guard conflict - {0}")]
    GuardConflict(String),

    /// E004: an external collaborator timed out or returned garbage
    #[error("E004: External collaborator failure ({collaborator}) - {reason}")]
    ExternalCollaboratorFailure {
        collaborator: String,
        reason: String,
    },

    /// E005: invalid configuration, the only class that aborts a run
    #[error("E005: Configuration error - {0}")]
    Configuration(String),

    /// E006: WAV decode or encode failure
    #[error("E006: Audio file error - {0}")]
    AudioFile(String),

    /// E007: resampler construction or processing failure
    #[error("E007: Resampling error - {0}")]
    Resample(String),

    /// E008: MIDI serialization failure
    #[error("E008: MIDI export error - {0}")]
    MidiExport(String),

    #[error("E009: I/O error - {0}")]
    Io(#[from] std::io::Error),

    #[error("E010: JSON error - {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn collaborator(collaborator: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::ExternalCollaboratorFailure {
            collaborator: collaborator.into(),
            reason: reason.into(),
        }
    }

    /// Whether the pipeline can continue past this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidInput(_)
                | PipelineError::InsufficientPool { .. }
                | PipelineError::GuardConflict(_)
                | PipelineError::ExternalCollaboratorFailure { .. }
        )
    }
}

impl From<hound::Error> for PipelineError {
    fn from(err: hound::Error) -> Self {
        match err {
            hound::Error::IoError(io) => PipelineError::Io(io),
            other => PipelineError::AudioFile(other.to_string()),
        }
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
