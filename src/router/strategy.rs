//! Strategy-driven ordering of a tier's eligible candidates.
//!
//! Every ordering ends with an ascending model-name tiebreak so fully-tied
//! candidates resolve deterministically.

use std::cmp::Ordering;

use serde::Serialize;

use super::config::Strategy;

/// One eligible model inside a tier, with the live pool numbers the
/// strategies rank by. `position` is the ordinal inside the tier's `models`.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub model: String,
    pub position: usize,
    pub available: u32,
    pub max_concurrency: u32,
    pub cost_per_m_tokens: f64,
}

/// A scored row of the selection table, surfaced by `explain`.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreRow {
    pub model: String,
    pub position: usize,
    pub available: u32,
    pub max_concurrency: u32,
    pub cost_per_m_tokens: f64,
    pub score: f64,
}

/// Order candidates in place, best first.
pub fn order_candidates(strategy: Strategy, candidates: &mut [Candidate]) {
    match strategy {
        Strategy::Quality => {
            candidates.sort_by(|a, b| {
                a.position
                    .cmp(&b.position)
                    .then_with(|| a.model.cmp(&b.model))
            });
        }
        // Pool shares the throughput ordering; the shared name tiebreak is
        // what gives it deterministic distribution across processes.
        Strategy::Throughput | Strategy::Pool => {
            candidates.sort_by(|a, b| {
                b.available
                    .cmp(&a.available)
                    .then_with(|| total_cmp(a.cost_per_m_tokens, b.cost_per_m_tokens))
                    .then_with(|| b.max_concurrency.cmp(&a.max_concurrency))
                    .then_with(|| a.model.cmp(&b.model))
            });
        }
        Strategy::Balanced => {
            let max_position = candidates
                .iter()
                .map(|candidate| candidate.position)
                .max()
                .unwrap_or(0);
            candidates.sort_by(|a, b| {
                total_cmp(
                    balanced_score(b, max_position),
                    balanced_score(a, max_position),
                )
                .then_with(|| a.model.cmp(&b.model))
            });
        }
    }
}

/// 0.6 weight on list position, 0.4 on free-capacity ratio.
#[must_use]
pub fn balanced_score(candidate: &Candidate, max_position: usize) -> f64 {
    let position_score = 1.0 - candidate.position as f64 / (max_position as f64 + 1.0);
    let capacity_ratio = if candidate.max_concurrency == 0 {
        0.0
    } else {
        f64::from(candidate.available) / f64::from(candidate.max_concurrency)
    };
    0.6 * position_score + 0.4 * capacity_ratio
}

/// Build the scoring table for `explain` from an already-ordered slice.
#[must_use]
pub fn scoring_table(strategy: Strategy, ordered: &[Candidate]) -> Vec<ScoreRow> {
    let max_position = ordered
        .iter()
        .map(|candidate| candidate.position)
        .max()
        .unwrap_or(0);
    ordered
        .iter()
        .map(|candidate| {
            let score = match strategy {
                Strategy::Balanced => balanced_score(candidate, max_position),
                Strategy::Quality => 1.0 / (candidate.position as f64 + 1.0),
                Strategy::Throughput | Strategy::Pool => f64::from(candidate.available),
            };
            ScoreRow {
                model: candidate.model.clone(),
                position: candidate.position,
                available: candidate.available,
                max_concurrency: candidate.max_concurrency,
                cost_per_m_tokens: candidate.cost_per_m_tokens,
                score,
            }
        })
        .collect()
}

fn total_cmp(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}
