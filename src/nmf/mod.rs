//! Nonnegative matrix factorization of the energy matrix.
//!
//! - [`engine`]: the rank search.  Every `(rank, run)` pair is an
//!   independent task with its own seeded random stream; the runs of one
//!   rank are reduced to that rank's best factorization and consensus
//!   statistics.
//! - [`update`]: Lee–Seung multiplicative updates (Euclidean / KL) behind
//!   the [`UpdateRule`] strategy trait.
//! - [`sparse`]: Hoyer's sparseness-constrained rule.
//! - [`consensus`]: connectivity, consensus matrix, cophenetic correlation
//!   and consensus-CDF statistics.
//! - [`rank`]: pluggable policies choosing which rank(s) to keep.
//!
//! ```
//! use spidet::nmf::NmfEngine;
//! use spidet::NmfConfig;
//! use ndarray::Array2;
//!
//! let v = Array2::from_shape_fn((4, 60), |(c, t)| 1.0 + ((c + 1) * t) as f64 % 7.0);
//! let cfg = NmfConfig { rank_range: (1, 2), n_runs: 3, ..NmfConfig::default() };
//! let engine = NmfEngine::new(cfg);
//! let result = engine.decompose_matrix(&v).unwrap();
//! assert_eq!(result.ranks.len(), 2);
//! ```

pub mod consensus;
pub mod engine;
pub mod rank;
pub mod sparse;
pub mod update;

use ndarray::Array2;
use serde::Serialize;

pub use engine::{best_run_index, run_seed, CancelToken, NmfEngine};
pub use rank::{selector_for, AllRanks, ConsensusCdf, LowestError, RankSelector, Stability};
pub use sparse::{project_sparse, sparseness};
pub use update::{build_rule, Multiplicative, StepOutcome, UpdateRule};

// ── Per-run records ──────────────────────────────────────────────────────────

/// How a single run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Relative objective change fell below `tol` (or the rule stalled).
    Converged,
    /// `max_iter` was reached first.
    IterationCap,
    /// The objective went non-finite or the relative residual exceeded the
    /// sanity floor.  Kept as a candidate, flagged in diagnostics.
    Unsound,
}

/// Diagnostics of one run, kept for every run even though only the best
/// run's matrices survive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub rank: usize,
    pub run: usize,
    pub seed: u64,
    /// Final value of the rule's objective.
    pub objective: f64,
    /// `‖V − WH‖_F / ‖V‖_F`.
    pub relative_residual: f64,
    pub iterations: usize,
    pub converged: bool,
    pub status: RunStatus,
}

/// A run stopped at the iteration cap before reaching tolerance.
///
/// Non-fatal: the run's partial result stays in the candidate pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConvergenceWarning {
    pub rank: usize,
    pub run: usize,
    pub iterations: usize,
    /// Relative objective change of the last iteration.
    pub last_relative_change: f64,
}

impl std::fmt::Display for ConvergenceWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "rank {} run {} did not converge in {} iterations (last relative change {:.3e})",
            self.rank, self.run, self.iterations, self.last_relative_change
        )
    }
}

// ── Factorization ────────────────────────────────────────────────────────────

/// One NMF solution `V ≈ W·H` of fixed rank.
#[derive(Debug, Clone, PartialEq)]
pub struct Factorization {
    pub rank: usize,
    /// `[channels, rank]`, non-negative.
    pub w: Array2<f64>,
    /// `[rank, bins]`, non-negative.
    pub h: Array2<f64>,
    pub record: RunRecord,
}

impl Factorization {
    /// `W·H`.
    pub fn reconstruct(&self) -> Array2<f64> {
        self.w.dot(&self.h)
    }
}

// ── Per-rank results ─────────────────────────────────────────────────────────

/// Whether a rank can be used downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RankStatus {
    /// At least one run converged.
    Usable,
    /// No run converged; reported, never silently dropped.
    Unusable,
}

/// Everything the search learned about one rank.
#[derive(Debug, Clone)]
pub struct RankResult {
    pub rank: usize,
    /// Lowest-objective run (ties to the earliest run).
    pub best: Factorization,
    /// One record per run, ordered by run index.
    pub runs: Vec<RunRecord>,
    pub warnings: Vec<ConvergenceWarning>,
    /// `[channels, channels]` mean connectivity.
    pub consensus: Array2<f64>,
    pub cophenetic: f64,
    /// Consensus CDF over [`consensus::CDF_BINS`] bins.
    pub cdf: Vec<f64>,
    pub cdf_area: f64,
    /// Relative CDF-area gain over the previous rank of the search.
    pub delta_k: f64,
    /// KL divergence of this rank's CDF from the previous rank's.
    pub delta_y: f64,
    pub status: RankStatus,
}

impl RankResult {
    #[inline]
    pub fn is_usable(&self) -> bool {
        self.status == RankStatus::Usable
    }

    pub fn instability(&self) -> f64 {
        1.0 - self.cophenetic
    }

    pub fn n_converged(&self) -> usize {
        self.runs.iter().filter(|r| r.converged).count()
    }

    pub fn summary(&self) -> RankSummary {
        RankSummary {
            rank: self.rank,
            best_run: self.best.record.run,
            min_objective: self.best.record.objective,
            relative_residual: self.best.record.relative_residual,
            cophenetic: self.cophenetic,
            instability: self.instability(),
            cdf_area: self.cdf_area,
            delta_k: self.delta_k,
            delta_y: self.delta_y,
            n_runs: self.runs.len(),
            n_converged: self.n_converged(),
            status: self.status,
        }
    }
}

/// Matrix-free per-rank metrics, one row of the rank-search report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankSummary {
    pub rank: usize,
    pub best_run: usize,
    pub min_objective: f64,
    pub relative_residual: f64,
    pub cophenetic: f64,
    pub instability: f64,
    pub cdf_area: f64,
    pub delta_k: f64,
    pub delta_y: f64,
    pub n_runs: usize,
    pub n_converged: usize,
    pub status: RankStatus,
}

/// Result of the whole rank search, ordered by rank.
#[derive(Debug, Clone)]
pub struct Decomposition {
    pub ranks: Vec<RankResult>,
}

impl Decomposition {
    pub fn rank(&self, k: usize) -> Option<&RankResult> {
        self.ranks.iter().find(|r| r.rank == k)
    }

    pub fn summaries(&self) -> Vec<RankSummary> {
        self.ranks.iter().map(RankResult::summary).collect()
    }

    /// Every run record of every rank.
    pub fn run_records(&self) -> impl Iterator<Item = &RunRecord> {
        self.ranks.iter().flat_map(|r| r.runs.iter())
    }
}
