//! Cross-agent capture-time skew
//!
//! For every unordered pair of agents and every round both reported, the
//! difference between their capture durations. A pure function over series
//! already collected by the coordinator.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use syncshot_core::AgentId;

/// Per-agent elapsed series, keyed by round index
pub type ElapsedSeries = BTreeMap<u32, Duration>;

/// Skew between two agents across the rounds both reported
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PairSkew {
    pub a: AgentId,
    pub b: AgentId,
    /// `(round, elapsed_a - elapsed_b)` in nanoseconds
    pub samples: Vec<(u32, i64)>,
}

impl PairSkew {
    /// Largest absolute difference, if any round was shared
    pub fn max_abs_nanos(&self) -> Option<u64> {
        self.samples.iter().map(|(_, d)| d.unsigned_abs()).max()
    }

    pub fn mean_nanos(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let total: i128 = self.samples.iter().map(|(_, d)| *d as i128).sum();
        Some(total as f64 / self.samples.len() as f64)
    }

    /// `None` when the two agents shared no measured round
    pub fn stats(&self) -> Option<PairSkewStats> {
        Some(PairSkewStats {
            a: self.a,
            b: self.b,
            rounds: self.samples.len(),
            max_abs_nanos: self.max_abs_nanos()?,
            mean_nanos: self.mean_nanos()?,
        })
    }
}

/// Per-pair skew figures for the session report
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PairSkewStats {
    pub a: AgentId,
    pub b: AgentId,
    pub rounds: usize,
    pub max_abs_nanos: u64,
    /// Signed: positive when `a` captured slower on average
    pub mean_nanos: f64,
}

fn signed_diff_nanos(a: Duration, b: Duration) -> i64 {
    let diff = a.as_nanos() as i128 - b.as_nanos() as i128;
    diff.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Pairwise skew for all `a < b`, considering rounds `>= from_round`
pub fn pairwise_skew(series: &BTreeMap<AgentId, ElapsedSeries>, from_round: u32) -> Vec<PairSkew> {
    let agents: Vec<(&AgentId, &ElapsedSeries)> = series.iter().collect();
    let mut pairs = Vec::with_capacity(agents.len() * agents.len().saturating_sub(1) / 2);

    for (i, (a, series_a)) in agents.iter().enumerate() {
        for (b, series_b) in &agents[i + 1..] {
            let samples = series_a
                .range(from_round..)
                .filter_map(|(round, elapsed_a)| {
                    series_b
                        .get(round)
                        .map(|elapsed_b| (*round, signed_diff_nanos(*elapsed_a, *elapsed_b)))
                })
                .collect();
            pairs.push(PairSkew {
                a: **a,
                b: **b,
                samples,
            });
        }
    }

    pairs
}

/// The pair with the largest absolute difference in any round
pub fn worst_pair(pairs: &[PairSkew]) -> Option<&PairSkew> {
    pairs
        .iter()
        .filter(|p| p.max_abs_nanos().is_some())
        .max_by_key(|p| p.max_abs_nanos())
}
