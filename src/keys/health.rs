//! Derived health scoring and latency summaries for keys.
//!
//! Scores are recomputed from raw state on every read and never stored back,
//! so they cannot drift from the ground truth they summarize.

use serde::Serialize;

use crate::collections::RingBuffer;

use super::state::CircuitState;

/// Latency summary computed lazily from a key's sample ring.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct LatencySummary {
    pub samples: usize,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub min_ms: u32,
    pub max_ms: u32,
}

#[must_use]
pub(crate) fn summarize_latency(ring: &RingBuffer<u32>) -> Option<LatencySummary> {
    if ring.is_empty() {
        return None;
    }

    let mut sorted: Vec<u32> = ring.iter().copied().collect();
    sorted.sort_unstable();
    let count = sorted.len();
    let sum: u64 = sorted.iter().map(|&sample| u64::from(sample)).sum();

    Some(LatencySummary {
        samples: count,
        avg_ms: sum as f64 / count as f64,
        p50_ms: f64::from(percentile(&sorted, 50.0)),
        p95_ms: f64::from(percentile(&sorted, 95.0)),
        p99_ms: f64::from(percentile(&sorted, 99.0)),
        min_ms: sorted[0],
        max_ms: sorted[count - 1],
    })
}

/// Nearest-rank percentile over sorted samples.
fn percentile(sorted: &[u32], q: f64) -> u32 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((q / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Health score in 0..100:
/// success rate x (1 - circuit penalty) x (1 - cooldown penalty) x latency score.
#[must_use]
pub(crate) fn health_score(
    total_requests: u64,
    success_count: u64,
    circuit: CircuitState,
    in_rate_limit_cooldown: bool,
    latency: Option<&LatencySummary>,
) -> f64 {
    let success_rate = if total_requests == 0 {
        1.0
    } else {
        success_count as f64 / total_requests as f64
    };

    let circuit_penalty = match circuit {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 0.5,
        CircuitState::Open => 1.0,
    };

    let cooldown_penalty = if in_rate_limit_cooldown { 0.5 } else { 0.0 };

    let latency_score = latency.map_or(1.0, |summary| {
        // Full credit under 1s average, sliding down to a 0.2 floor at 11s.
        (1.0 - (summary.avg_ms - 1_000.0) / 10_000.0).clamp(0.2, 1.0)
    });

    (success_rate * (1.0 - circuit_penalty) * (1.0 - cooldown_penalty) * latency_score * 100.0)
        .clamp(0.0, 100.0)
}
