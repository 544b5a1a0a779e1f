//! Domain types shared by the pipeline passes

use crate::config::GridConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Rhythmic function a sample plays in the generated groove
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Core,
    Accent,
    Motion,
    Fill,
    Texture,
}

impl Role {
    pub const ALL: [Role; 5] = [Role::Core, Role::Accent, Role::Motion, Role::Fill, Role::Texture];

    /// Roles whose pools must hold at least `min_size` samples
    pub const REQUIRED: [Role; 3] = [Role::Core, Role::Accent, Role::Motion];

    pub fn index(self) -> usize {
        match self {
            Role::Core => 0,
            Role::Accent => 1,
            Role::Motion => 2,
            Role::Fill => 3,
            Role::Texture => 4,
        }
    }

    pub fn is_required(self) -> bool {
        matches!(self, Role::Core | Role::Accent | Role::Motion)
    }

    pub fn is_percussive(self) -> bool {
        !matches!(self, Role::Texture)
    }

    /// Lower wins when a grid step runs out of polyphony
    pub fn priority(self) -> u8 {
        match self {
            Role::Core => 0,
            Role::Accent => 1,
            Role::Fill => 2,
            Role::Motion => 3,
            Role::Texture => 4,
        }
    }

    /// General MIDI drum note for standard drum mapping
    pub fn midi_note(self) -> u8 {
        match self {
            Role::Core => 36,    // C2 bass drum
            Role::Accent => 38,  // D2 snare
            Role::Motion => 42,  // F#2 closed hi-hat
            Role::Fill => 45,    // A2 low tom
            Role::Texture => 49, // C#3 crash
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Role::Core => "CORE",
            Role::Accent => "ACCENT",
            Role::Motion => "MOTION",
            Role::Fill => "FILL",
            Role::Texture => "TEXTURE",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Probability-like weight per role, indexed by [`Role::index`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "RoleScoreMap", into = "RoleScoreMap")]
pub struct RoleScores(pub [f32; 5]);

/// Keyed JSON form of [`RoleScores`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct RoleScoreMap {
    pub core: f32,
    pub accent: f32,
    pub motion: f32,
    pub fill: f32,
    pub texture: f32,
}

impl From<RoleScoreMap> for RoleScores {
    fn from(m: RoleScoreMap) -> Self {
        RoleScores([m.core, m.accent, m.motion, m.fill, m.texture])
    }
}

impl From<RoleScores> for RoleScoreMap {
    fn from(s: RoleScores) -> Self {
        let [core, accent, motion, fill, texture] = s.0;
        RoleScoreMap {
            core,
            accent,
            motion,
            fill,
            texture,
        }
    }
}

impl RoleScores {
    pub fn uniform() -> Self {
        RoleScores([0.2; 5])
    }

    pub fn get(&self, role: Role) -> f32 {
        self.0[role.index()]
    }

    pub fn set(&mut self, role: Role, value: f32) {
        self.0[role.index()] = value;
    }

    /// Temperature softmax, shifted by the maximum for stability
    pub fn softmax(raw: [f32; 5], tau: f32) -> Self {
        let max = raw.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut exps = [0.0f32; 5];
        for (e, &r) in exps.iter_mut().zip(raw.iter()) {
            *e = ((r - max) / tau).exp();
        }
        RoleScores(exps).normalized()
    }

    /// Clamp negatives and non-finite entries to zero, then rescale to sum 1.
    /// An all-zero vector becomes uniform.
    pub fn normalized(self) -> Self {
        let mut v = self.0;
        for x in v.iter_mut() {
            if !x.is_finite() || *x < 0.0 {
                *x = 0.0;
            }
        }
        let sum: f32 = v.iter().sum();
        if sum <= f32::EPSILON {
            return Self::uniform();
        }
        for x in v.iter_mut() {
            *x /= sum;
        }
        RoleScores(v)
    }

    /// Normalized copy of a distribution supplied from outside, or `None`
    /// if it contains NaN, infinities, negatives or sums to zero.
    pub fn validated(self) -> Option<Self> {
        if self.0.iter().any(|x| !x.is_finite() || *x < 0.0) {
            return None;
        }
        if self.0.iter().sum::<f32>() <= f32::EPSILON {
            return None;
        }
        Some(self.normalized())
    }

    pub fn is_normalized(&self, tolerance: f32) -> bool {
        self.0.iter().all(|x| x.is_finite() && *x >= 0.0)
            && (self.0.iter().sum::<f32>() - 1.0).abs() <= tolerance
    }

    /// Roles ordered by descending score; ties keep role order
    pub fn ranked(&self) -> [Role; 5] {
        let mut roles = Role::ALL;
        roles.sort_by(|a, b| self.get(*b).total_cmp(&self.get(*a)));
        roles
    }

    pub fn argmax(&self) -> Role {
        self.ranked()[0]
    }

    pub fn second_best(&self) -> Role {
        self.ranked()[1]
    }

    pub fn confidence(&self) -> f32 {
        self.get(self.argmax())
    }

    /// Top score minus runner-up score
    pub fn margin(&self) -> f32 {
        let ranked = self.ranked();
        self.get(ranked[0]) - self.get(ranked[1])
    }

    /// Highest score among all roles except `role`
    pub fn best_other(&self, role: Role) -> f32 {
        Role::ALL
            .iter()
            .filter(|&&r| r != role)
            .map(|&r| self.get(r))
            .fold(0.0, f32::max)
    }
}

/// Onset detected in the input signal
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Onset {
    /// Time in seconds
    pub time_s: f32,
    /// Frame index in the analysis spectrogram
    pub frame: usize,
    /// Summed band flux at the detected peak
    pub strength: f32,
}

/// A sliced segment of the input belonging to one onset
#[derive(Debug, Clone)]
pub struct Hit {
    pub id: String,
    pub onset: Onset,
    pub start_s: f32,
    pub end_s: f32,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Hit {
    pub fn duration_s(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// Scalar DSP descriptors for one hit
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DspFeatures {
    pub energy: f32,
    pub sharpness: f32,
    /// Seconds, clipped to the attack window
    pub attack_time: f32,
    /// Seconds, clipped to the decay window
    pub decay_time: f32,
    pub low_ratio: f32,
    pub mid_ratio: f32,
    pub high_ratio: f32,
    pub spectral_flatness: f32,
    pub zero_crossing_rate: f32,
}

/// Time descriptors remapped onto [0, 1]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeShape {
    pub fast_attack: f32,
    pub short_decay: f32,
    pub long_decay: f32,
}

impl DspFeatures {
    pub fn time_shape(&self, attack_window_s: f32, decay_window_s: f32) -> TimeShape {
        let attack = (self.attack_time / attack_window_s.max(f32::EPSILON)).clamp(0.0, 1.0);
        let decay = (self.decay_time / decay_window_s.max(f32::EPSILON)).clamp(0.0, 1.0);
        TimeShape {
            fast_attack: 1.0 - attack,
            short_decay: 1.0 - decay,
            long_decay: decay,
        }
    }
}

/// Result of analysing one hit
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureOutcome {
    Valid {
        dsp: DspFeatures,
        embedding: Vec<f32>,
    },
    Invalid {
        reason: String,
    },
}

impl FeatureOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, FeatureOutcome::Valid { .. })
    }

    pub fn dsp(&self) -> Option<&DspFeatures> {
        match self {
            FeatureOutcome::Valid { dsp, .. } => Some(dsp),
            FeatureOutcome::Invalid { .. } => None,
        }
    }

    pub fn embedding(&self) -> Option<&[f32]> {
        match self {
            FeatureOutcome::Valid { embedding, .. } => Some(embedding),
            FeatureOutcome::Invalid { .. } => None,
        }
    }
}

/// Near-duplicate hits collapsed together. Indices refer to the hit list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub members: Vec<usize>,
    pub representative: usize,
    /// False when the hit had no valid features
    pub scoreable: bool,
}

/// Hit that reached scoring without usable features
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnscoreableHit {
    pub hit_id: String,
    pub reason: String,
}

/// Which guard rails fired for a sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardFlags {
    pub texture_suppression: bool,
    pub sustained_noise: bool,
    pub motion_minimum: bool,
    pub fill_conservative: bool,
    pub low_confidence_texture: bool,
}

impl GuardFlags {
    pub fn any(&self) -> bool {
        self.texture_suppression
            || self.sustained_noise
            || self.motion_minimum
            || self.fill_conservative
            || self.low_confidence_texture
    }

    /// Roles a sample may not be promoted or moved into
    pub fn disqualifies(&self, role: Role) -> bool {
        match role {
            Role::Texture => self.texture_suppression,
            Role::Core | Role::Accent => self.sustained_noise,
            Role::Motion => self.motion_minimum,
            Role::Fill => false,
        }
    }
}

/// Every score vector a sample passed through
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub rule: RoleScores,
    pub external: Option<RoleScores>,
    pub fused: RoleScores,
    pub guarded: RoleScores,
}

/// Cluster representative carrying its role decision
#[derive(Debug, Clone)]
pub struct Sample {
    pub id: String,
    pub hit_id: String,
    pub role: Role,
    pub cluster_size: usize,
    pub features: DspFeatures,
    pub scores: ScoreBreakdown,
    pub guards: GuardFlags,
    /// Representative audio at `sample_rate`; empty when loaded from a manifest
    pub audio: Vec<f32>,
    pub sample_rate: u32,
}

impl Sample {
    pub fn final_scores(&self) -> &RoleScores {
        &self.scores.guarded
    }

    pub fn score_for(&self, role: Role) -> f32 {
        self.scores.guarded.get(role)
    }

    pub fn confidence(&self) -> f32 {
        self.scores.guarded.confidence()
    }

    pub fn margin(&self) -> f32 {
        self.scores.guarded.margin()
    }

    pub fn second_best(&self) -> Role {
        self.scores.guarded.second_best()
    }

    pub fn is_disqualified(&self, role: Role) -> bool {
        self.guards.disqualifies(role)
    }
}

/// Role-indexed sample pools
#[derive(Debug, Clone, Default)]
pub struct Pools {
    entries: [Vec<Sample>; 5],
}

impl Pools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, role: Role) -> &[Sample] {
        &self.entries[role.index()]
    }

    pub fn push(&mut self, role: Role, sample: Sample) {
        self.entries[role.index()].push(sample);
    }

    pub fn len(&self, role: Role) -> usize {
        self.entries[role.index()].len()
    }

    pub fn total(&self) -> usize {
        self.entries.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (Role, &[Sample])> {
        Role::ALL.into_iter().map(move |r| (r, self.get(r)))
    }

    pub fn find(&self, sample_id: &str) -> Option<&Sample> {
        self.entries.iter().flatten().find(|s| s.id == sample_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolMove {
    pub sample_id: String,
    pub from: Role,
    pub to: Role,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Eviction {
    pub sample_id: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolShortfall {
    pub role: Role,
    pub size: usize,
    pub min_size: usize,
}

/// What pool assembly had to do to satisfy the size bounds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolReport {
    pub promotions: Vec<PoolMove>,
    pub rebalances: Vec<PoolMove>,
    pub evictions: Vec<Eviction>,
    pub insufficient: Vec<PoolShortfall>,
}

/// Absolute timing of every grid coordinate
#[derive(Debug, Clone, PartialEq)]
pub struct GridTime {
    pub config: GridConfig,
    pub seconds_per_beat: f64,
    pub seconds_per_bar: f64,
    pub seconds_per_step: f64,
    /// `step_times[bar][step]` in seconds from the start of bar 0
    pub step_times: Vec<Vec<f64>>,
}

impl GridTime {
    pub fn time_at(&self, bar: u32, step: u32) -> Option<f64> {
        self.step_times
            .get(bar as usize)
            .and_then(|row| row.get(step as usize))
            .copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Skeleton,
    Humanized,
    UserEdit,
}

/// One scheduled sample trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub bar: u32,
    pub step: u32,
    pub role: Role,
    pub sample_id: String,
    pub velocity: f32,
    pub duration_steps: u32,
    #[serde(default)]
    pub micro_offset_ms: f32,
    pub source: EventSource,
}

/// Terminal artifact: grid settings plus ordered events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventGrid {
    pub grid: GridConfig,
    pub events: Vec<Event>,
}

/// Order events by coordinate, then role priority
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| {
        (a.bar, a.step, a.role.priority())
            .cmp(&(b.bar, b.step, b.role.priority()))
            .then_with(|| a.sample_id.cmp(&b.sample_id))
    });
}
