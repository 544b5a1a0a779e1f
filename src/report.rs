//! Per-run pipeline report: stage outcomes, degradations and sample fates

use crate::analysis::{Eviction, PoolMove, PoolShortfall, Role, RoleScores, UnscoreableHit};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Skipped,
    Degraded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: String,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Guards flipped a confident fused decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardConflictRecord {
    pub sample_id: String,
    pub fused_role: Role,
    pub final_role: Role,
    pub fused: RoleScores,
    pub guarded: RoleScores,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageCounts {
    pub onsets: usize,
    pub hits: usize,
    pub clusters: usize,
    pub samples: usize,
    pub pooled: usize,
    pub events: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub version: String,
    pub input: Option<String>,
    pub stages: Vec<StageRecord>,
    pub counts: StageCounts,
    pub unscoreable: Vec<UnscoreableHit>,
    pub promotions: Vec<PoolMove>,
    pub rebalances: Vec<PoolMove>,
    pub evictions: Vec<Eviction>,
    pub insufficient_pools: Vec<PoolShortfall>,
    pub guard_conflicts: Vec<GuardConflictRecord>,
}

impl PipelineReport {
    pub fn new(input: Option<String>) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            input,
            ..Default::default()
        }
    }

    pub fn record(&mut self, stage: &str, status: StageStatus, reason: Option<String>) {
        self.stages.push(StageRecord {
            stage: stage.to_string(),
            status,
            reason,
        });
    }

    pub fn succeeded(&mut self, stage: &str) {
        self.record(stage, StageStatus::Succeeded, None);
    }

    pub fn skipped(&mut self, stage: &str, reason: impl Into<String>) {
        self.record(stage, StageStatus::Skipped, Some(reason.into()));
    }

    pub fn degraded(&mut self, stage: &str, reason: impl Into<String>) {
        self.record(stage, StageStatus::Degraded, Some(reason.into()));
    }

    pub fn failed(&mut self, stage: &str, reason: impl Into<String>) {
        self.record(stage, StageStatus::Failed, Some(reason.into()));
    }

    /// Latest record for a stage
    pub fn stage(&self, stage: &str) -> Option<&StageRecord> {
        self.stages.iter().rev().find(|r| r.stage == stage)
    }

    pub fn status_of(&self, stage: &str) -> Option<StageStatus> {
        self.stage(stage).map(|r| r.status)
    }

    pub fn is_degraded(&self) -> bool {
        self.stages
            .iter()
            .any(|r| matches!(r.status, StageStatus::Degraded | StageStatus::Failed))
    }
}

/// Write the report as `pipeline_report.json`
pub fn export_report(report: &PipelineReport, output_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(output_dir)?;
    let report_path = output_dir.join("pipeline_report.json");
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(&report_path, json)?;
    info!(path = %report_path.display(), "exported pipeline report");
    Ok(())
}
