//! Pass 4: Hit Deduplication (average-linkage agglomerative clustering)

use crate::analysis::{Cluster, FeatureOutcome};
use crate::config::Config;
use crate::error::Result;
use crate::state::PipelineState;
use tracing::{debug, info};

pub const STAGE: &str = "dedup";

/// Cosine distance in [0, 2]. Two zero vectors are identical; a zero vector
/// is maximally unlike anything else.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    match (na > 0.0, nb > 0.0) {
        (false, false) => 0.0,
        (true, true) => (1.0 - dot / (na * nb)).clamp(0.0, 2.0),
        _ => 1.0,
    }
}

/// Symmetric pairwise distance matrix, row-major
fn distance_matrix(vectors: &[&[f32]]) -> Vec<f32> {
    let n = vectors.len();
    let mut dist = vec![0.0f32; n * n];
    for i in 0..n {
        for j in i + 1..n {
            let d = cosine_distance(vectors[i], vectors[j]);
            dist[i * n + j] = d;
            dist[j * n + i] = d;
        }
    }
    dist
}

/// Group vectors by average linkage, merging while the closest pair of
/// clusters is strictly nearer than `threshold`. Returns member index lists
/// in ascending order.
pub fn agglomerate(vectors: &[&[f32]], threshold: f32) -> Vec<Vec<usize>> {
    let n = vectors.len();
    let mut dist = distance_matrix(vectors);
    let mut members: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();
    let mut active = vec![true; n];

    loop {
        let mut best: Option<(usize, usize, f32)> = None;
        for i in (0..n).filter(|&i| active[i]) {
            for j in (i + 1..n).filter(|&j| active[j]) {
                let d = dist[i * n + j];
                if d < threshold && best.map_or(true, |(_, _, bd)| d < bd) {
                    best = Some((i, j, d));
                }
            }
        }
        let Some((i, j, d)) = best else { break };

        // Lance-Williams update for average linkage
        let (ni, nj) = (members[i].len() as f32, members[j].len() as f32);
        for k in (0..n).filter(|&k| active[k] && k != i && k != j) {
            let merged = (ni * dist[i * n + k] + nj * dist[j * n + k]) / (ni + nj);
            dist[i * n + k] = merged;
            dist[k * n + i] = merged;
        }
        let absorbed = std::mem::take(&mut members[j]);
        members[i].extend(absorbed);
        members[i].sort_unstable();
        active[j] = false;
        debug!(into = i, from = j, distance = d, "merged clusters");
    }

    members
        .into_iter()
        .zip(active)
        .filter_map(|(m, a)| a.then_some(m))
        .collect()
}

/// Member with the smallest mean distance to the others; ties go to the
/// earliest member
pub fn medoid(members: &[usize], vectors: &[&[f32]]) -> usize {
    let mut best = members[0];
    let mut best_sum = f32::INFINITY;
    for &m in members {
        let sum: f32 = members
            .iter()
            .filter(|&&o| o != m)
            .map(|&o| cosine_distance(vectors[m], vectors[o]))
            .sum();
        if sum < best_sum {
            best_sum = sum;
            best = m;
        }
    }
    best
}

/// Partition hits into clusters. Indices in the result refer to `features`.
pub fn cluster_hits(features: &[FeatureOutcome], threshold: f32) -> Vec<Cluster> {
    let valid: Vec<usize> = (0..features.len())
        .filter(|&i| features[i].is_valid())
        .collect();
    let vectors: Vec<&[f32]> = valid
        .iter()
        .filter_map(|&i| features[i].embedding())
        .collect();

    let mut clusters: Vec<Cluster> = agglomerate(&vectors, threshold)
        .into_iter()
        .map(|local| {
            let representative = valid[medoid(&local, &vectors)];
            Cluster {
                members: local.iter().map(|&l| valid[l]).collect(),
                representative,
                scoreable: true,
            }
        })
        .collect();

    clusters.extend(
        (0..features.len())
            .filter(|&i| !features[i].is_valid())
            .map(|i| Cluster {
                members: vec![i],
                representative: i,
                scoreable: false,
            }),
    );

    clusters.sort_by_key(|c| c.members[0]);
    clusters
}

pub fn run(state: &mut PipelineState, config: &Config) -> Result<()> {
    info!("Pass 4: Deduplication");

    state.clusters = cluster_hits(&state.features, config.dedup.threshold);
    state.report.counts.clusters = state.clusters.len();
    state.report.succeeded(STAGE);

    info!(
        hits = state.hits.len(),
        clusters = state.clusters.len(),
        threshold = config.dedup.threshold,
        "deduplication complete"
    );
    Ok(())
}
