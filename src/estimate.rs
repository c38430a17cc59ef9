//! Advisory runtime estimate. Informational only; nothing gates on it.
use std::time::Duration;

/// Rough cost of one genotype cell for one cluster.
const SECONDS_PER_CELL_CLUSTER: f64 = 2.0e-6;

/// Fixed start-up cost of a single trial.
const SECONDS_PER_TRIAL: f64 = 5.0;

/// Estimate wall-clock time for `k_count` K values of `runs_per_k` trials
/// each over a `samples` by `loci` genotype matrix.
///
/// Any non-positive input yields `Duration::ZERO`.
pub fn estimate_runtime(k_count: i64, samples: i64, loci: i64, runs_per_k: i64) -> Duration {
    if k_count <= 0 || samples <= 0 || loci <= 0 || runs_per_k <= 0 {
        return Duration::ZERO;
    }
    let trials = k_count as f64 * runs_per_k as f64;
    let per_trial = samples as f64 * loci as f64 * k_count as f64 * SECONDS_PER_CELL_CLUSTER;
    Duration::try_from_secs_f64(trials * (per_trial + SECONDS_PER_TRIAL)).unwrap_or(Duration::MAX)
}
