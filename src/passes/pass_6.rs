//! Pass 6: Pool Building (promotion, rebalancing, eviction)

use crate::analysis::{Eviction, PoolMove, PoolReport, PoolShortfall, Pools, Role, Sample};
use crate::config::{Config, PoolConfig};
use crate::error::{PipelineError, Result};
use crate::state::PipelineState;
use tracing::{debug, info, warn};

pub const STAGE: &str = "pools";

/// Working assignment of samples to roles while the bounds are enforced
struct Assignment<'a> {
    samples: &'a [Sample],
    roles: Vec<Role>,
    evicted: Vec<bool>,
}

impl<'a> Assignment<'a> {
    fn new(samples: &'a [Sample]) -> Self {
        Self {
            samples,
            roles: samples.iter().map(|s| s.role).collect(),
            evicted: vec![false; samples.len()],
        }
    }

    fn members(&self, role: Role) -> Vec<usize> {
        (0..self.samples.len())
            .filter(|&i| !self.evicted[i] && self.roles[i] == role)
            .collect()
    }

    fn count(&self, role: Role) -> usize {
        self.members(role).len()
    }

    /// Highest score for `role` among `candidates`; ties go to the earlier sample
    fn best_for(&self, role: Role, candidates: impl Iterator<Item = usize>) -> Option<usize> {
        candidates.fold(None, |best: Option<usize>, i| match best {
            Some(b) if self.samples[b].score_for(role) >= self.samples[i].score_for(role) => Some(b),
            _ => Some(i),
        })
    }
}

/// Fill required pools up to their minimum by promoting eligible samples
fn promote(assignment: &mut Assignment, cfg: &PoolConfig, report: &mut PoolReport) {
    for role in Role::REQUIRED {
        let min_size = cfg.min_for(role);
        while assignment.count(role) < min_size {
            let eligible: Vec<usize> = (0..assignment.samples.len())
                .filter(|&i| {
                    let from = assignment.roles[i];
                    !assignment.evicted[i]
                        && from != role
                        && !assignment.samples[i].is_disqualified(role)
                        && !(from.is_required() && assignment.count(from) <= cfg.min_for(from))
                })
                .collect();

            let preferred = eligible
                .iter()
                .copied()
                .filter(|&i| assignment.samples[i].second_best() == role);
            let chosen = assignment
                .best_for(role, preferred)
                .or_else(|| assignment.best_for(role, eligible.iter().copied()));

            let Some(i) = chosen else {
                report.insufficient.push(PoolShortfall {
                    role,
                    size: assignment.count(role),
                    min_size,
                });
                break;
            };

            let from = assignment.roles[i];
            assignment.roles[i] = role;
            debug!(sample = %assignment.samples[i].id, %from, to = %role, "promoted");
            report.promotions.push(PoolMove {
                sample_id: assignment.samples[i].id.clone(),
                from,
                to: role,
            });
        }
    }
}

/// Shrink overfull pools, moving low-margin samples before evicting any
fn rebalance(assignment: &mut Assignment, cfg: &PoolConfig, report: &mut PoolReport) {
    for role in Role::ALL {
        let max_size = cfg.max_for(role);
        while assignment.count(role) > max_size {
            let mut members = assignment.members(role);
            members.sort_by(|&a, &b| {
                assignment.samples[a]
                    .margin()
                    .total_cmp(&assignment.samples[b].margin())
            });

            let mut moved = None;
            'members: for &i in &members {
                let sample = &assignment.samples[i];
                for alt in sample.final_scores().ranked() {
                    if alt != role
                        && !sample.is_disqualified(alt)
                        && assignment.count(alt) < cfg.max_for(alt)
                    {
                        moved = Some((i, alt));
                        break 'members;
                    }
                }
            }

            match moved {
                Some((i, to)) => {
                    assignment.roles[i] = to;
                    debug!(sample = %assignment.samples[i].id, from = %role, %to, "rebalanced");
                    report.rebalances.push(PoolMove {
                        sample_id: assignment.samples[i].id.clone(),
                        from: role,
                        to,
                    });
                }
                None => {
                    let score = |i: usize| assignment.samples[i].score_for(role);
                    let lowest = members.iter().copied().fold(None, |low: Option<usize>, i| match low {
                        Some(l) if score(l) < score(i) => Some(l),
                        _ => Some(i),
                    });
                    let Some(i) = lowest else { break };
                    assignment.evicted[i] = true;
                    debug!(sample = %assignment.samples[i].id, %role, "evicted");
                    report.evictions.push(Eviction {
                        sample_id: assignment.samples[i].id.clone(),
                        role,
                    });
                }
            }
        }
    }
}

/// Group samples into bounded role pools, each ordered by descending score
pub fn build_pools(samples: &[Sample], cfg: &PoolConfig) -> (Pools, PoolReport) {
    let mut report = PoolReport::default();
    let mut assignment = Assignment::new(samples);

    promote(&mut assignment, cfg, &mut report);
    rebalance(&mut assignment, cfg, &mut report);

    let mut pools = Pools::new();
    for role in Role::ALL {
        let mut members: Vec<Sample> = assignment
            .members(role)
            .into_iter()
            .map(|i| {
                let mut sample = samples[i].clone();
                sample.role = role;
                sample
            })
            .collect();
        members.sort_by(|a, b| b.score_for(role).total_cmp(&a.score_for(role)));
        for sample in members {
            pools.push(role, sample);
        }
    }

    (pools, report)
}

pub fn run(state: &mut PipelineState, config: &Config) -> Result<()> {
    info!("Pass 6: Pool Building");

    let (pools, pool_report) = build_pools(&state.samples, &config.pools);

    for shortfall in &pool_report.insufficient {
        let err = PipelineError::InsufficientPool {
            role: shortfall.role,
            size: shortfall.size,
            min_size: shortfall.min_size,
        };
        warn!("{}", err);
    }

    let report = &mut state.report;
    report.promotions = pool_report.promotions.clone();
    report.rebalances = pool_report.rebalances.clone();
    report.evictions = pool_report.evictions.clone();
    report.insufficient_pools = pool_report.insufficient.clone();
    report.counts.pooled = pools.total();

    if pool_report.insufficient.is_empty() {
        report.succeeded(STAGE);
    } else {
        let roles: Vec<String> = pool_report
            .insufficient
            .iter()
            .map(|s| s.role.to_string())
            .collect();
        report.degraded(STAGE, format!("under-filled pools: {}", roles.join(", ")));
    }

    for (role, members) in pools.iter() {
        debug!(%role, size = members.len(), "pool");
    }
    info!(
        pooled = pools.total(),
        promotions = pool_report.promotions.len(),
        rebalances = pool_report.rebalances.len(),
        evictions = pool_report.evictions.len(),
        "pool building complete"
    );

    state.pools = pools;
    state.pool_report = pool_report;
    Ok(())
}
