//! Configuration system for the drumgrid pipeline

use crate::analysis::Role;
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub version: String,
    pub audio: AudioConfig,
    pub stft: StftConfig,
    pub onset: OnsetConfig,
    pub slicer: SlicerConfig,
    pub features: FeatureConfig,
    pub dedup: DedupConfig,
    pub scoring: ScoringConfig,
    pub pools: PoolConfig,
    pub grid: GridConfig,
    pub skeleton: SkeletonConfig,
    pub collaborators: CollaboratorConfig,
    pub export: ExportConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            audio: AudioConfig::default(),
            stft: StftConfig::default(),
            onset: OnsetConfig::default(),
            slicer: SlicerConfig::default(),
            features: FeatureConfig::default(),
            dedup: DedupConfig::default(),
            scoring: ScoringConfig::default(),
            pools: PoolConfig::default(),
            grid: GridConfig::default(),
            skeleton: SkeletonConfig::default(),
            collaborators: CollaboratorConfig::default(),
            export: ExportConfig::default(),
        }
    }
}

/// Audio conditioning applied before feature analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Rate every hit is resampled to before feature extraction
    pub analysis_sample_rate: u32,
    pub peak_target: f32,
    /// Leading/trailing trim threshold in dB below the hit peak
    pub trim_top_db: f32,
    pub min_analysis_duration_s: f32,
    /// Peak amplitude below which a hit counts as silent
    pub silence_peak: f32,
    /// Inputs shorter than this are treated as one-shots and never separated
    pub one_shot_threshold_s: f32,
    /// The input is a full mix and should go through source separation
    pub full_mix: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            analysis_sample_rate: 16000,
            peak_target: 0.95,
            trim_top_db: 30.0,
            min_analysis_duration_s: 0.02,
            silence_peak: 1e-6,
            one_shot_threshold_s: 10.0,
            full_mix: false,
        }
    }
}

/// STFT configuration shared by onset detection and feature extraction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StftConfig {
    pub n_fft: usize,
    pub hop_length: usize,
    pub window: String,
}

impl Default for StftConfig {
    fn default() -> Self {
        Self {
            n_fft: 1024,
            hop_length: 256,
            window: "hann".to_string(),
        }
    }
}

/// How two onsets closer than the merge window collapse into one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    KeepEarlier,
    KeepStronger,
}

/// Onset detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OnsetConfig {
    /// Band split points in Hz; the last band runs to Nyquist
    pub band_edges_hz: Vec<f32>,
    /// Total width of the sliding window for the adaptive threshold
    pub threshold_window_s: f32,
    pub threshold_k: f32,
    /// Relative floor as a fraction of the envelope maximum
    pub delta: f32,
    /// Absolute envelope floor
    pub min_strength: f32,
    pub merge_ms: f32,
    pub merge_policy: MergePolicy,
    pub backtrack: bool,
}

impl Default for OnsetConfig {
    fn default() -> Self {
        Self {
            band_edges_hz: vec![0.0, 200.0, 1000.0, 8000.0],
            threshold_window_s: 0.5,
            threshold_k: 1.0,
            delta: 0.05,
            min_strength: 1e-4,
            merge_ms: 100.0,
            merge_policy: MergePolicy::KeepEarlier,
            backtrack: true,
        }
    }
}

/// Hit slicing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlicerConfig {
    pub max_hit_duration_s: f32,
    pub min_hit_duration_s: f32,
    pub trim_silence_db: f32,
    pub fade_out_ms: f32,
}

impl Default for SlicerConfig {
    fn default() -> Self {
        Self {
            max_hit_duration_s: 2.0,
            min_hit_duration_s: 0.05,
            trim_silence_db: 70.0,
            fade_out_ms: 50.0,
        }
    }
}

/// Per-hit DSP descriptor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub attack_window_s: f32,
    pub decay_window_s: f32,
    /// Fraction of the baseline-to-peak rise that ends the attack
    pub attack_rise: f32,
    /// Fraction of the peak RMS that ends the decay
    pub decay_floor: f32,
    pub low_band_hz: [f32; 2],
    pub mid_band_hz: [f32; 2],
    pub high_band_hz: [f32; 2],
    pub n_mfcc: usize,
    pub n_mels: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            attack_window_s: 0.08,
            decay_window_s: 0.6,
            attack_rise: 0.9,
            decay_floor: 0.3,
            low_band_hz: [20.0, 150.0],
            mid_band_hz: [150.0, 2000.0],
            high_band_hz: [2000.0, 8000.0],
            n_mfcc: 13,
            n_mels: 40,
        }
    }
}

/// Deduplication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Cosine-distance merge threshold; 0 disables merging
    pub threshold: f32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { threshold: 0.5 }
    }
}

/// A DSP-derived input to a role formula
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Term {
    Energy,
    InverseEnergy,
    Sharpness,
    InverseSharpness,
    LowRatio,
    MidRatio,
    HighRatio,
    LowMidRatio,
    FastAttack,
    ShortDecay,
    LongDecay,
    Flatness,
    ZeroCrossingRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightedTerm {
    pub term: Term,
    pub weight: f32,
}

impl WeightedTerm {
    pub const fn new(term: Term, weight: f32) -> Self {
        Self { term, weight }
    }
}

/// Linear combination of terms producing one raw role score
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleFormula {
    pub terms: Vec<WeightedTerm>,
}

impl RoleFormula {
    pub fn weight_sum(&self) -> f32 {
        self.terms.iter().map(|t| t.weight).sum()
    }
}

/// Rule formulas for all five roles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleFormulas {
    pub core: RoleFormula,
    pub accent: RoleFormula,
    pub motion: RoleFormula,
    pub fill: RoleFormula,
    pub texture: RoleFormula,
}

impl RoleFormulas {
    pub fn for_role(&self, role: Role) -> &RoleFormula {
        match role {
            Role::Core => &self.core,
            Role::Accent => &self.accent,
            Role::Motion => &self.motion,
            Role::Fill => &self.fill,
            Role::Texture => &self.texture,
        }
    }
}

impl Default for RoleFormulas {
    fn default() -> Self {
        use Term::*;
        let formula = |terms: &[(Term, f32)]| RoleFormula {
            terms: terms
                .iter()
                .map(|&(term, weight)| WeightedTerm::new(term, weight))
                .collect(),
        };
        Self {
            core: formula(&[
                (LowRatio, 0.40),
                (FastAttack, 0.25),
                (ShortDecay, 0.25),
                (InverseSharpness, 0.10),
            ]),
            accent: formula(&[
                (Energy, 0.35),
                (Sharpness, 0.35),
                (MidRatio, 0.20),
                (ShortDecay, 0.10),
            ]),
            motion: formula(&[
                (HighRatio, 0.40),
                (InverseEnergy, 0.20),
                (ShortDecay, 0.25),
                (Sharpness, 0.15),
            ]),
            fill: formula(&[
                (Energy, 0.30),
                (LongDecay, 0.35),
                (Sharpness, 0.25),
                (MidRatio, 0.10),
            ]),
            texture: formula(&[
                (LongDecay, 0.45),
                (InverseSharpness, 0.25),
                (LowMidRatio, 0.20),
                (InverseEnergy, 0.10),
            ]),
        }
    }
}

/// Guard rail thresholds and dampening factors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub texture_sharpness_min: f32,
    pub texture_decay_max_s: f32,
    pub texture_factor: f32,

    pub sustained_decay_min_s: f32,
    pub sustained_flatness_min: f32,
    pub sustained_factor: f32,

    pub motion_high_min: f32,
    pub motion_decay_max_s: f32,
    pub motion_factor: f32,

    pub fill_min_prob: f32,
    pub fill_min_margin: f32,
    pub fill_factor: f32,

    pub low_conf_texture_enabled: bool,
    pub low_conf_margin: f32,
    pub low_conf_factor: f32,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            texture_sharpness_min: 0.5,
            texture_decay_max_s: 0.15,
            texture_factor: 0.60,
            sustained_decay_min_s: 0.40,
            sustained_flatness_min: 0.5,
            sustained_factor: 0.75,
            motion_high_min: 0.25,
            motion_decay_max_s: 0.25,
            motion_factor: 0.75,
            fill_min_prob: 0.20,
            fill_min_margin: 0.02,
            fill_factor: 0.85,
            low_conf_texture_enabled: true,
            low_conf_margin: 0.05,
            low_conf_factor: 0.80,
        }
    }
}

/// Role scoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Softmax temperature for rule scores
    pub tau: f32,
    /// Weight of rule scores when fusing with external scores
    pub alpha: f32,
    /// Fused margin above which a guard-induced flip is reported
    pub conflict_margin: f32,
    pub formulas: RoleFormulas,
    pub guards: GuardConfig,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            tau: 1.0,
            alpha: 0.9,
            conflict_margin: 0.15,
            formulas: RoleFormulas::default(),
            guards: GuardConfig::default(),
        }
    }
}

/// Per-role maximum pool sizes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSizes {
    pub core: usize,
    pub accent: usize,
    pub motion: usize,
    pub fill: usize,
    pub texture: usize,
}

impl PoolSizes {
    pub fn for_role(&self, role: Role) -> usize {
        match role {
            Role::Core => self.core,
            Role::Accent => self.accent,
            Role::Motion => self.motion,
            Role::Fill => self.fill,
            Role::Texture => self.texture,
        }
    }
}

impl Default for PoolSizes {
    fn default() -> Self {
        Self {
            core: 4,
            accent: 4,
            motion: 8,
            fill: 4,
            texture: 4,
        }
    }
}

/// Pool assembly configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Minimum size for the required roles (CORE, ACCENT, MOTION)
    pub min_size: usize,
    pub max_sizes: PoolSizes,
}

impl PoolConfig {
    pub fn min_for(&self, role: Role) -> usize {
        if role.is_required() {
            self.min_size
        } else {
            0
        }
    }

    pub fn max_for(&self, role: Role) -> usize {
        self.max_sizes.for_role(role)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_sizes: PoolSizes::default(),
        }
    }
}

/// Tempo, meter and grid resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub bpm: f64,
    pub meter_numerator: u32,
    pub meter_denominator: u32,
    pub steps_per_bar: u32,
    pub num_bars: u32,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            bpm: 120.0,
            meter_numerator: 4,
            meter_denominator: 4,
            steps_per_bar: 16,
            num_bars: 4,
        }
    }
}

/// `velocity = intercept + slope * energy`, clamped to [0, 1]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VelocityCurve {
    pub intercept: f32,
    pub slope: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VelocityCurves {
    pub core: VelocityCurve,
    pub accent: VelocityCurve,
    pub motion: VelocityCurve,
    pub fill: VelocityCurve,
    pub texture: VelocityCurve,
}

impl VelocityCurves {
    pub fn for_role(&self, role: Role) -> VelocityCurve {
        match role {
            Role::Core => self.core,
            Role::Accent => self.accent,
            Role::Motion => self.motion,
            Role::Fill => self.fill,
            Role::Texture => self.texture,
        }
    }
}

impl Default for VelocityCurves {
    fn default() -> Self {
        let curve = |intercept, slope| VelocityCurve { intercept, slope };
        Self {
            core: curve(0.60, 0.40),
            accent: curve(0.70, 0.30),
            motion: curve(0.25, 0.35),
            fill: curve(0.75, 0.25),
            texture: curve(0.15, 0.20),
        }
    }
}

/// Named CORE/ACCENT step presets for a 16-step bar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternStyle {
    Rock,
    House,
    Techno,
    Hiphop,
    Trap,
    Funk,
    Rnb,
    Dnb,
}

impl PatternStyle {
    /// `(core_steps, accent_steps)`
    pub fn steps(self) -> (&'static [u32], &'static [u32]) {
        match self {
            PatternStyle::Rock => (&[0, 8], &[4, 12]),
            PatternStyle::House | PatternStyle::Techno => (&[0, 4, 8, 12], &[4, 12]),
            PatternStyle::Hiphop | PatternStyle::Trap | PatternStyle::Dnb => (&[0, 10], &[4, 12]),
            PatternStyle::Funk => (&[0, 7, 10], &[4, 12]),
            PatternStyle::Rnb => (&[0, 3, 8], &[4, 12]),
        }
    }
}

/// How fill steps are drawn from the fill window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillMode {
    /// 1..=`fill_max_events` steps chosen uniformly
    Random,
    /// One of the fixed shapes from [`fill_patterns`], picked by `fill_pattern_weights`
    Patterns,
}

/// Fill shapes over a window: one-shot, two-shot, three-shot, offbeat roll, full roll.
///
/// Windows shorter than four steps get the shapes that fit.
pub fn fill_patterns(window: &[u32]) -> Vec<Vec<u32>> {
    match *window {
        [] => Vec::new(),
        [a] => vec![vec![a]],
        [a, b] => vec![vec![b], vec![a, b]],
        [a, b, c] => vec![vec![c], vec![b, c], vec![a, b, c]],
        [s0, s1, s2, s3, ..] => vec![
            vec![s3],
            vec![s2, s3],
            vec![s1, s2, s3],
            vec![s0, s2, s3],
            vec![s0, s1, s2, s3],
        ],
    }
}

/// Skeleton pattern generation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SkeletonConfig {
    pub seed: u64,
    pub max_poly: usize,
    /// Overrides `core_steps` and `accent_steps` when set
    pub pattern_style: Option<PatternStyle>,
    pub core_steps: Vec<u32>,
    pub accent_steps: Vec<u32>,
    pub motion_mandatory_steps: Vec<u32>,
    pub motion_secondary_steps: Vec<u32>,
    /// Target MOTION events per bar, mandatory steps included
    pub motion_per_bar: usize,
    pub motion_max_samples: usize,
    pub fill_every_n_bars: u32,
    pub fill_prob: f64,
    pub fill_steps: Vec<u32>,
    pub fill_max_events: usize,
    pub fill_mode: FillMode,
    pub fill_pattern_weights: Vec<f64>,
    pub texture_enabled: bool,
    /// Decay longer than this fraction of a step earns a two-step duration
    pub long_decay_step_ratio: f32,
    pub velocity: VelocityCurves,
}

impl Default for SkeletonConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            max_poly: 3,
            pattern_style: None,
            core_steps: vec![0, 4, 8, 12],
            accent_steps: vec![4, 12],
            motion_mandatory_steps: vec![2, 6, 10, 14],
            motion_secondary_steps: vec![1, 3, 5, 7, 9, 11, 13, 15],
            motion_per_bar: 6,
            motion_max_samples: 4,
            fill_every_n_bars: 4,
            fill_prob: 0.25,
            fill_steps: vec![12, 13, 14, 15],
            fill_max_events: 3,
            fill_mode: FillMode::Random,
            fill_pattern_weights: vec![0.35, 0.30, 0.20, 0.10, 0.05],
            texture_enabled: true,
            long_decay_step_ratio: 0.95,
            velocity: VelocityCurves::default(),
        }
    }
}

impl SkeletonConfig {
    /// CORE and ACCENT steps after applying `pattern_style`
    pub fn core_accent_steps(&self) -> (Vec<u32>, Vec<u32>) {
        match self.pattern_style {
            Some(style) => {
                let (core, accent) = style.steps();
                (core.to_vec(), accent.to_vec())
            }
            None => (self.core_steps.clone(), self.accent_steps.clone()),
        }
    }
}

/// Built-in humanizer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HumanizeConfig {
    pub enabled: bool,
    pub seed: u64,
    pub timing_ms: f32,
    pub velocity_jitter: f32,
}

impl Default for HumanizeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            seed: 7,
            timing_ms: 10.0,
            velocity_jitter: 0.05,
        }
    }
}

/// External collaborator wiring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaboratorConfig {
    pub timeout_ms: u64,
    /// JSON file of precomputed semantic role scores keyed by hit id
    pub semantic_scores: Option<PathBuf>,
    pub humanize: HumanizeConfig,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            semantic_scores: None,
            humanize: HumanizeConfig::default(),
        }
    }
}

/// Export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub write_samples: bool,
    pub write_midi: bool,
    pub midi_ppq: u16,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            write_samples: true,
            write_midi: true,
            midi_ppq: 960,
        }
    }
}

fn invalid(msg: impl Into<String>) -> PipelineError {
    PipelineError::Configuration(msg.into())
}

/// Validate the grid section on its own; the skeleton subcommand
/// overrides tempo and bar count after loading.
pub fn validate_grid(grid: &GridConfig) -> Result<()> {
    if !(grid.bpm.is_finite() && grid.bpm > 0.0) {
        return Err(invalid(format!("bpm must be positive, got {}", grid.bpm)));
    }
    if grid.meter_numerator == 0 {
        return Err(invalid("meter_numerator must be at least 1"));
    }
    if grid.meter_denominator == 0 || !grid.meter_denominator.is_power_of_two() {
        return Err(invalid(format!(
            "meter_denominator must be a power of two, got {}",
            grid.meter_denominator
        )));
    }
    if grid.steps_per_bar == 0 {
        return Err(invalid("steps_per_bar must be at least 1"));
    }
    if grid.num_bars == 0 {
        return Err(invalid("num_bars must be at least 1"));
    }
    Ok(())
}

/// Validate configuration parameters
pub fn validate_config(config: &Config) -> Result<()> {
    validate_grid(&config.grid)?;

    if config.stft.n_fft < 2 || config.stft.hop_length == 0 {
        return Err(invalid("n_fft must be >= 2 and hop_length >= 1"));
    }
    if config.audio.analysis_sample_rate == 0 {
        return Err(invalid("analysis_sample_rate must be positive"));
    }
    if config.onset.band_edges_hz.is_empty()
        || config.onset.band_edges_hz.windows(2).any(|w| w[0] >= w[1])
    {
        return Err(invalid("onset band edges must be non-empty and increasing"));
    }
    if config.onset.merge_ms < 0.0 {
        return Err(invalid("merge_ms must not be negative"));
    }
    if config.slicer.min_hit_duration_s > config.slicer.max_hit_duration_s {
        return Err(invalid("min_hit_duration_s exceeds max_hit_duration_s"));
    }
    if !(0.0..=2.0).contains(&config.dedup.threshold) {
        return Err(invalid(format!(
            "dedup threshold must lie in [0, 2], got {}",
            config.dedup.threshold
        )));
    }

    let scoring = &config.scoring;
    if scoring.tau.is_nan() || scoring.tau <= 0.0 {
        return Err(invalid("softmax temperature tau must be positive"));
    }
    if !(0.0..=1.0).contains(&scoring.alpha) {
        return Err(invalid(format!("alpha must lie in [0, 1], got {}", scoring.alpha)));
    }
    for role in Role::ALL {
        let sum = scoring.formulas.for_role(role).weight_sum();
        if (sum - 1.0).abs() > 1e-3 {
            return Err(invalid(format!(
                "{} formula weights sum to {:.3}, expected 1",
                role, sum
            )));
        }
    }
    let guards = &scoring.guards;
    for (name, factor) in [
        ("texture_factor", guards.texture_factor),
        ("sustained_factor", guards.sustained_factor),
        ("motion_factor", guards.motion_factor),
        ("fill_factor", guards.fill_factor),
        ("low_conf_factor", guards.low_conf_factor),
    ] {
        if !(0.0..=1.0).contains(&factor) {
            return Err(invalid(format!("{} must lie in [0, 1], got {}", name, factor)));
        }
    }

    for role in Role::ALL {
        if config.pools.min_for(role) > config.pools.max_for(role) {
            return Err(invalid(format!("{} min_size exceeds max_size", role)));
        }
    }

    let skeleton = &config.skeleton;
    let steps = config.grid.steps_per_bar;
    let (core_steps, accent_steps) = skeleton.core_accent_steps();
    for (name, pattern) in [
        ("core_steps", &core_steps),
        ("accent_steps", &accent_steps),
        ("motion_mandatory_steps", &skeleton.motion_mandatory_steps),
        ("motion_secondary_steps", &skeleton.motion_secondary_steps),
        ("fill_steps", &skeleton.fill_steps),
    ] {
        if let Some(step) = pattern.iter().find(|&&s| s >= steps) {
            return Err(invalid(format!(
                "{} contains step {} outside a {}-step bar",
                name, step, steps
            )));
        }
    }
    if skeleton.max_poly == 0 {
        return Err(invalid("max_poly must be at least 1"));
    }
    if skeleton.fill_every_n_bars == 0 {
        return Err(invalid("fill_every_n_bars must be at least 1"));
    }
    if !(0.0..=1.0).contains(&skeleton.fill_prob) {
        return Err(invalid("fill_prob must lie in [0, 1]"));
    }
    if skeleton.fill_mode == FillMode::Patterns {
        let weights = &skeleton.fill_pattern_weights;
        let shapes = fill_patterns(&skeleton.fill_steps).len();
        if weights.len() != shapes {
            return Err(invalid(format!(
                "fill_pattern_weights has {} entries for {} fill shapes",
                weights.len(),
                shapes
            )));
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) || weights.iter().sum::<f64>() <= 0.0 {
            return Err(invalid("fill_pattern_weights must be non-negative with a positive sum"));
        }
    }

    Ok(())
}

/// Load configuration from JSON file
pub fn load_config<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Config> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&content)?;
    validate_config(&config)?;
    Ok(config)
}

/// Save configuration to JSON file
pub fn save_config<P: AsRef<std::path::Path>>(config: &Config, path: P) -> anyhow::Result<()> {
    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_default_formulas_sum_to_one() {
        let formulas = RoleFormulas::default();
        for role in Role::ALL {
            assert!((formulas.for_role(role).weight_sum() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_rejects_bad_grid() {
        let mut config = Config::default();
        config.grid.bpm = 0.0;
        assert!(matches!(
            validate_config(&config),
            Err(PipelineError::Configuration(_))
        ));

        let mut config = Config::default();
        config.grid.steps_per_bar = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_rejects_pattern_outside_bar() {
        let mut config = Config::default();
        config.grid.steps_per_bar = 12;
        // default MOTION and FILL patterns reach step 15
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{ "grid": { "bpm": 90.0 }, "dedup": { "threshold": 0.3 } }"#)
                .unwrap();
        assert_eq!(config.grid.bpm, 90.0);
        assert_eq!(config.grid.steps_per_bar, 16);
        assert_eq!(config.dedup.threshold, 0.3);
        assert_eq!(config.onset.merge_policy, MergePolicy::KeepEarlier);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = Config::default();
        config.grid.num_bars = 8;
        config.skeleton.seed = 7;
        save_config(&config, &path).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.grid, config.grid);
        assert_eq!(loaded.skeleton.seed, 7);
    }

    #[test]
    fn test_fill_shapes_fit_the_window() {
        assert_eq!(fill_patterns(&[12, 13, 14, 15])[3], vec![12, 14, 15]);
        assert_eq!(fill_patterns(&[6, 7]), vec![vec![7], vec![6, 7]]);
        assert!(fill_patterns(&[]).is_empty());
    }

    #[test]
    fn test_rejects_mismatched_fill_weights() {
        let mut config = Config::default();
        config.skeleton.fill_mode = FillMode::Patterns;
        assert!(validate_config(&config).is_ok());
        config.skeleton.fill_pattern_weights = vec![1.0, 1.0];
        assert!(validate_config(&config).is_err());
        config.skeleton.fill_pattern_weights = vec![0.0; 5];
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_style_presets_need_a_sixteen_step_bar() {
        let mut config = Config::default();
        config.grid.steps_per_bar = 8;
        config.skeleton.core_steps = vec![0, 4];
        config.skeleton.accent_steps = vec![2, 6];
        config.skeleton.fill_steps = vec![6, 7];
        config.skeleton.motion_mandatory_steps = vec![1, 3, 5, 7];
        config.skeleton.motion_secondary_steps = vec![];
        assert!(validate_config(&config).is_ok());
        config.skeleton.pattern_style = Some(PatternStyle::Rock);
        assert!(validate_config(&config).is_err());

        let style: SkeletonConfig = serde_json::from_str(r#"{ "pattern_style": "hiphop" }"#).unwrap();
        assert_eq!(style.core_accent_steps().0, vec![0, 10]);
    }
}
