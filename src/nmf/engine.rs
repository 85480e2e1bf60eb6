//! Rank search: repeated randomly initialised NMF runs per rank.
//!
//! Scheduling: every `(rank, run)` pair is an independent task reading the
//! shared energy matrix and owning its own W/H.  Ranks are processed in
//! parallel and, inside each rank, runs are processed in parallel; the
//! reduction of a rank (best run, consensus) starts as soon as that rank's
//! runs are done.
//!
//! Memory: a run reports only its diagnostics and its channel labels.  The
//! winning run is replayed from its seed to recover W and H, which keeps the
//! footprint of a rank at one factorization regardless of `n_runs`.
//!
//! Reproducibility: run `r` of rank `k` draws from a ChaCha8 stream seeded
//! by [`run_seed`]`(seed, k, r)`, so results do not depend on thread
//! scheduling, and adding runs never changes the earlier ones.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
#[cfg(feature = "parallel")]
use rayon::iter::ParallelIterator;
use tracing::{debug, info, warn};

use crate::config::{Initialization, NmfConfig};
use crate::energy::EnergyMatrix;
use crate::error::{invalid, Result, SpidetError};
use crate::iter_maybe_parallel;

use super::consensus::{
    area_under, connectivity_labels, consensus_cdf, consensus_matrix, cophenetic_correlation,
    delta_k, delta_y,
};
use super::update::{build_rule, relative_residual};
use super::{
    ConvergenceWarning, Decomposition, Factorization, RankResult, RankStatus, RunRecord, RunStatus,
};

/// Shared flag that stops a running decomposition.
///
/// Cloning yields a handle to the same flag.  Once set, no further run is
/// started, runs in flight abort at their next iteration, and the
/// decomposition returns [`SpidetError::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Seed of run `run` of rank `rank`: SplitMix64 over the packed triple.
pub fn run_seed(base: u64, rank: usize, run: usize) -> u64 {
    let mut z = base ^ ((rank as u64) << 40) ^ run as u64;
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Uniform sample in `(0, 1]`, so no factor entry starts at an absorbing zero.
#[inline]
fn positive_uniform(rng: &mut ChaCha8Rng) -> f64 {
    1.0 - rng.gen::<f64>()
}

fn initialize(
    v: &Array2<f64>,
    rank: usize,
    init: Initialization,
    rng: &mut ChaCha8Rng,
) -> (Array2<f64>, Array2<f64>) {
    let (n_ch, n_t) = v.dim();
    let mean = v.mean().unwrap_or(0.0).max(f64::MIN_POSITIVE);
    let scale = (mean / rank as f64).sqrt();
    match init {
        Initialization::Random => {
            let w = Array2::from_shape_simple_fn((n_ch, rank), || positive_uniform(rng) * scale);
            let h = Array2::from_shape_simple_fn((rank, n_t), || positive_uniform(rng) * scale);
            (w, h)
        }
        Initialization::RandomVcol => {
            let p = (n_t / 5).max(1);
            let mut w = Array2::<f64>::zeros((n_ch, rank));
            for a in 0..rank {
                let mut col = w.column_mut(a);
                for _ in 0..p {
                    let j = rng.gen_range(0..n_t);
                    col += &v.column(j);
                }
                col.mapv_inplace(|x| (x / p as f64).max(f64::MIN_POSITIVE));
            }
            let h = Array2::from_shape_simple_fn((rank, n_t), || positive_uniform(rng) * scale);
            (w, h)
        }
    }
}

fn check_ranks(k_min: usize, k_max: usize, v: &Array2<f64>) -> Result<()> {
    let limit = v.nrows().min(v.ncols());
    if k_min == 0 || k_min > k_max || k_max > limit {
        return Err(SpidetError::InvalidRank { k_min, k_max, limit });
    }
    Ok(())
}

/// Index of the run a rank keeps: runs within the sanity floor before
/// unsound ones, then the lowest objective, then the earliest run.
/// `None` for an empty slice.
pub fn best_run_index(records: &[RunRecord]) -> Option<usize> {
    let key = |r: &RunRecord| {
        let objective = if r.objective.is_finite() { r.objective } else { f64::INFINITY };
        (r.status == RunStatus::Unsound, objective)
    };
    records
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            let (ua, oa) = key(a);
            let (ub, ob) = key(b);
            ua.cmp(&ub).then(oa.total_cmp(&ob))
        })
        .map(|(i, _)| i)
}

/// What a run contributes to its rank's reduction.
struct RunOutput {
    record: RunRecord,
    labels: Vec<usize>,
    warning: Option<ConvergenceWarning>,
}

/// The NMF rank search.
#[derive(Debug, Clone)]
pub struct NmfEngine {
    cfg: NmfConfig,
    cancel: CancelToken,
}

impl NmfEngine {
    pub fn new(cfg: NmfConfig) -> Self {
        Self { cfg, cancel: CancelToken::new() }
    }

    /// Use `token` to cancel this engine's decompositions from another thread.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &NmfConfig {
        &self.cfg
    }

    /// Structural checks done before any run is scheduled.
    ///
    /// # Errors
    ///
    /// [`SpidetError::InvalidInput`] for bad run parameters or a matrix that
    /// is empty, all zero, negative or non-finite;
    /// [`SpidetError::InvalidRank`] when the rank range is empty, starts at
    /// zero or exceeds `min(channels, bins)`.
    pub fn validate(&self, v: &Array2<f64>) -> Result<()> {
        self.validate_input(v)?;
        let (k_min, k_max) = self.cfg.rank_range;
        check_ranks(k_min, k_max, v)
    }

    /// Run parameters and matrix contents, independent of any rank.
    fn validate_input(&self, v: &Array2<f64>) -> Result<()> {
        self.cfg.validate()?;
        let (n_ch, n_t) = v.dim();
        if n_ch == 0 || n_t == 0 {
            invalid!("energy matrix is empty ({n_ch} x {n_t})");
        }
        if v.iter().any(|x| !(x.is_finite() && *x >= 0.0)) {
            invalid!("energy matrix must be finite and non-negative");
        }
        if v.iter().all(|&x| x == 0.0) {
            invalid!("energy matrix is identically zero");
        }
        Ok(())
    }

    /// Run `run` of rank `rank` to completion.
    ///
    /// Returns `None` if the engine was cancelled before or during the run.
    /// The matrix is assumed valid (see [`NmfEngine::validate`]).
    pub fn factorize(&self, v: &Array2<f64>, rank: usize, run: usize) -> Option<Factorization> {
        self.run_once(v, rank, run).map(|(f, _)| f)
    }

    fn run_once(
        &self,
        v: &Array2<f64>,
        rank: usize,
        run: usize,
    ) -> Option<(Factorization, Option<ConvergenceWarning>)> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let seed = run_seed(self.cfg.seed, rank, run);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let (mut w, mut h) = initialize(v, rank, self.cfg.init, &mut rng);
        let mut rule = build_rule(&self.cfg);
        rule.prepare(v, &mut w, &mut h);

        let mut objective = rule.objective(v, &w, &h);
        let mut converged = false;
        let mut iterations = 0;
        let mut last_change = f64::INFINITY;
        while iterations < self.cfg.max_iter {
            if self.cancel.is_cancelled() {
                return None;
            }
            let step = rule.step(v, &mut w, &mut h);
            iterations += 1;
            if !step.objective.is_finite() {
                objective = step.objective;
                break;
            }
            last_change = (objective - step.objective).abs() / objective.max(f64::MIN_POSITIVE);
            objective = step.objective;
            if last_change < self.cfg.tol || step.stalled {
                converged = true;
                break;
            }
        }

        let residual = relative_residual(v, &w, &h);
        let sound =
            objective.is_finite() && residual.is_finite() && residual <= self.cfg.sanity_floor;
        let status = match (sound, converged) {
            (false, _) => RunStatus::Unsound,
            (true, true) => RunStatus::Converged,
            (true, false) => RunStatus::IterationCap,
        };
        let warning = (!converged && iterations == self.cfg.max_iter).then(|| ConvergenceWarning {
            rank,
            run,
            iterations,
            last_relative_change: last_change,
        });
        debug!(rank, run, objective, residual, iterations, ?status, "nmf run finished");

        let record = RunRecord {
            rank,
            run,
            seed,
            objective,
            relative_residual: residual,
            iterations,
            converged,
            status,
        };
        Some((Factorization { rank, w, h, record }, warning))
    }

    /// All runs of one rank, reduced.
    ///
    /// # Errors
    ///
    /// [`SpidetError::InvalidInput`] for bad run parameters or matrix
    /// contents (see [`NmfEngine::validate`]),
    /// [`SpidetError::InvalidRank`] if `rank` is outside `1..=min(C, T)`,
    /// [`SpidetError::Cancelled`] if cancelled.
    pub fn run_rank(&self, v: &Array2<f64>, rank: usize) -> Result<RankResult> {
        self.validate_input(v)?;
        check_ranks(rank, rank, v)?;
        let mut result = self.search_rank(v, rank)?;
        result.delta_k = result.cdf_area;
        Ok(result)
    }

    fn search_rank(&self, v: &Array2<f64>, rank: usize) -> Result<RankResult> {
        let n_runs = self.cfg.n_runs;
        let outputs: Vec<Option<RunOutput>> = iter_maybe_parallel!(0..n_runs)
            .map(|run| {
                self.run_once(v, rank, run).map(|(f, warning)| RunOutput {
                    labels: connectivity_labels(&f.w),
                    record: f.record,
                    warning,
                })
            })
            .collect();
        let Some(outputs) = outputs.into_iter().collect::<Option<Vec<RunOutput>>>() else {
            return Err(SpidetError::Cancelled);
        };

        let records: Vec<RunRecord> = outputs.iter().map(|o| o.record.clone()).collect();
        let Some(best_run) = best_run_index(&records) else {
            invalid!("rank {rank} has no runs to choose from");
        };
        let (best, _) = self.run_once(v, rank, best_run).ok_or(SpidetError::Cancelled)?;
        debug_assert_eq!(
            best.record.objective.to_bits(),
            outputs[best_run].record.objective.to_bits(),
            "replayed run diverged from its first execution"
        );

        let mut runs = Vec::with_capacity(n_runs);
        let mut labels = Vec::with_capacity(n_runs);
        let mut warnings = Vec::new();
        for out in outputs {
            if let Some(w) = out.warning {
                warn!("{w}");
                warnings.push(w);
            }
            runs.push(out.record);
            labels.push(out.labels);
        }

        let consensus = consensus_matrix(&labels, v.nrows());
        let cophenetic = cophenetic_correlation(&consensus);
        let cdf = consensus_cdf(&consensus);
        let area = area_under(&cdf);
        let status = if runs.iter().any(|r| r.converged) {
            RankStatus::Usable
        } else {
            warn!(rank, n_runs, "no run converged; rank reported unusable");
            RankStatus::Unusable
        };
        if best.record.status == RunStatus::Unsound {
            warn!(
                rank,
                run = best_run,
                residual = best.record.relative_residual,
                "best run is above the sanity floor"
            );
        }
        debug!(rank, best_run, objective = best.record.objective, cophenetic, "rank finished");

        Ok(RankResult {
            rank,
            best,
            runs,
            warnings,
            consensus,
            cophenetic,
            cdf,
            cdf_area: area,
            delta_k: 0.0,
            delta_y: 0.0,
            status,
        })
    }

    /// Factorize `v` for every rank of the configured range.
    ///
    /// # Errors
    ///
    /// See [`NmfEngine::validate`]; [`SpidetError::Cancelled`] if cancelled.
    pub fn decompose_matrix(&self, v: &Array2<f64>) -> Result<Decomposition> {
        self.validate(v)?;
        let (k_min, k_max) = self.cfg.rank_range;
        info!(
            channels = v.nrows(),
            bins = v.ncols(),
            k_min,
            k_max,
            n_runs = self.cfg.n_runs,
            sparse = self.cfg.sparseness.is_some(),
            workers = crate::parallel::worker_count(),
            "starting NMF rank search"
        );

        let results: Vec<Result<RankResult>> = iter_maybe_parallel!(k_min..=k_max)
            .map(|k| self.search_rank(v, k))
            .collect();
        let mut ranks = results.into_iter().collect::<Result<Vec<_>>>()?;

        let areas: Vec<f64> = ranks.iter().map(|r| r.cdf_area).collect();
        let cdfs: Vec<Vec<f64>> = ranks.iter().map(|r| r.cdf.clone()).collect();
        for ((r, dk), dy) in ranks.iter_mut().zip(delta_k(&areas)).zip(delta_y(&cdfs)) {
            r.delta_k = dk;
            r.delta_y = dy;
        }
        info!(ranks = ranks.len(), "NMF rank search finished");
        Ok(Decomposition { ranks })
    }

    /// [`NmfEngine::decompose_matrix`] on an [`EnergyMatrix`].
    pub fn decompose(&self, energy: &EnergyMatrix) -> Result<Decomposition> {
        self.decompose_matrix(energy.data())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn two_pattern_matrix() -> Array2<f64> {
        let w = array![[1.0, 0.0], [0.8, 0.1], [0.0, 1.0], [0.1, 0.9]];
        let h = Array2::from_shape_fn((2, 40), |(a, t)| {
            if a == 0 {
                1.0 + (t as f64 * 0.3).sin().abs()
            } else {
                0.5 + (t as f64 * 0.7).cos().abs()
            }
        });
        w.dot(&h)
    }

    #[test]
    fn seeds_are_distinct_and_stable() {
        assert_eq!(run_seed(42, 2, 7), run_seed(42, 2, 7));
        assert_ne!(run_seed(42, 2, 7), run_seed(42, 2, 8));
        assert_ne!(run_seed(42, 2, 7), run_seed(42, 3, 7));
        assert_ne!(run_seed(42, 2, 7), run_seed(43, 2, 7));
    }

    #[test]
    fn rank_range_validated_before_runs() {
        let v = two_pattern_matrix();
        for range in [(0, 2), (3, 2), (2, 5)] {
            let engine =
                NmfEngine::new(NmfConfig { rank_range: range, n_runs: 1, ..NmfConfig::default() });
            let err = engine.decompose_matrix(&v).unwrap_err();
            assert!(matches!(err, SpidetError::InvalidRank { limit: 4, .. }), "{range:?}: {err}");
        }
    }

    #[test]
    fn negative_matrix_rejected() {
        let mut v = two_pattern_matrix();
        v[[0, 0]] = -1.0;
        let engine =
            NmfEngine::new(NmfConfig { rank_range: (1, 2), n_runs: 1, ..NmfConfig::default() });
        assert!(matches!(engine.decompose_matrix(&v), Err(SpidetError::InvalidInput(_))));
    }

    #[test]
    fn single_rank_search_validates_input() {
        let v = two_pattern_matrix();
        let no_runs = NmfEngine::new(NmfConfig { n_runs: 0, ..NmfConfig::default() });
        assert!(matches!(no_runs.run_rank(&v, 2), Err(SpidetError::InvalidInput(_))));

        let engine = NmfEngine::new(NmfConfig { n_runs: 2, ..NmfConfig::default() });
        let mut bad = v.clone();
        bad[[0, 0]] = f64::NAN;
        bad[[1, 1]] = -5.0;
        assert!(matches!(engine.run_rank(&bad, 2), Err(SpidetError::InvalidInput(_))));
        bad[[0, 0]] = 1.0;
        assert!(matches!(engine.run_rank(&bad, 2), Err(SpidetError::InvalidInput(_))));
        assert!(matches!(
            engine.run_rank(&Array2::zeros((4, 40)), 2),
            Err(SpidetError::InvalidInput(_))
        ));
        assert!(matches!(engine.run_rank(&v, 5), Err(SpidetError::InvalidRank { limit: 4, .. })));
        assert!(matches!(engine.run_rank(&v, 0), Err(SpidetError::InvalidRank { .. })));
    }

    fn record(run: usize, objective: f64, status: RunStatus) -> RunRecord {
        RunRecord {
            rank: 2,
            run,
            seed: run as u64,
            objective,
            relative_residual: 0.1,
            iterations: 10,
            converged: status == RunStatus::Converged,
            status,
        }
    }

    #[test]
    fn best_run_prefers_sound_over_lower_objective() {
        let runs = vec![
            record(0, 0.5, RunStatus::Unsound),
            record(1, 2.0, RunStatus::IterationCap),
            record(2, 1.0, RunStatus::Converged),
            record(3, 1.0, RunStatus::Converged),
            record(4, f64::NAN, RunStatus::Unsound),
        ];
        assert_eq!(best_run_index(&runs), Some(2));
        // Only unsound runs left: lowest finite objective wins.
        let unsound = vec![
            record(0, f64::NAN, RunStatus::Unsound),
            record(1, 3.0, RunStatus::Unsound),
            record(2, 2.0, RunStatus::Unsound),
        ];
        assert_eq!(best_run_index(&unsound), Some(2));
        assert_eq!(best_run_index(&[]), None);
    }

    #[test]
    fn unsound_runs_are_kept_and_still_selectable() {
        // Rank 1 cannot reproduce a rank-2 matrix, so no run meets the floor.
        let v = two_pattern_matrix();
        let cfg = NmfConfig { n_runs: 4, sanity_floor: 1e-12, ..NmfConfig::default() };
        let rank = NmfEngine::new(cfg).run_rank(&v, 1).unwrap();
        assert_eq!(rank.runs.len(), 4);
        assert!(rank.runs.iter().all(|r| r.status == RunStatus::Unsound));
        assert_eq!(rank.best.record.status, RunStatus::Unsound);
        let min = rank.runs.iter().map(|r| r.objective).fold(f64::INFINITY, f64::min);
        assert_eq!(rank.best.record.objective, min);
    }

    #[test]
    fn sound_run_chosen_under_kl_objective() {
        let v = two_pattern_matrix();
        let base = NmfConfig {
            n_runs: 8,
            max_iter: 50,
            objective: crate::config::Objective::KullbackLeibler,
            ..NmfConfig::default()
        };
        let loose = NmfEngine::new(base.clone()).run_rank(&v, 2).unwrap();
        // Floor at the smallest residual: that run is sound, possibly alone.
        let floor = loose.runs.iter().map(|r| r.relative_residual).fold(f64::INFINITY, f64::min);
        let strict =
            NmfEngine::new(NmfConfig { sanity_floor: floor, ..base }).run_rank(&v, 2).unwrap();

        let sound: Vec<&RunRecord> =
            strict.runs.iter().filter(|r| r.status != RunStatus::Unsound).collect();
        assert!(!sound.is_empty());
        assert!(sound.iter().all(|r| r.relative_residual <= floor));
        assert_ne!(strict.best.record.status, RunStatus::Unsound);
        let min_sound = sound.iter().map(|r| r.objective).fold(f64::INFINITY, f64::min);
        assert_eq!(strict.best.record.objective, min_sound);
        // Same seeds, same runs: only the classification changed.
        for (a, b) in loose.runs.iter().zip(&strict.runs) {
            assert_eq!(a.objective.to_bits(), b.objective.to_bits());
        }
    }

    #[test]
    fn iteration_cap_produces_warning_not_error() {
        let v = two_pattern_matrix();
        let cfg = NmfConfig {
            rank_range: (2, 2),
            n_runs: 3,
            max_iter: 2,
            tol: 1e-15,
            ..NmfConfig::default()
        };
        let result = NmfEngine::new(cfg).decompose_matrix(&v).unwrap();
        let rank = &result.ranks[0];
        assert_eq!(rank.warnings.len(), 3);
        assert!(rank.runs.iter().all(|r| !r.converged && r.iterations == 2));
        assert_eq!(rank.status, RankStatus::Unusable);
    }

    #[test]
    fn best_run_has_lowest_objective() {
        let v = two_pattern_matrix();
        let cfg = NmfConfig { rank_range: (2, 2), n_runs: 6, ..NmfConfig::default() };
        let rank = NmfEngine::new(cfg).run_rank(&v, 2).unwrap();
        let min = rank.runs.iter().map(|r| r.objective).fold(f64::INFINITY, f64::min);
        assert_eq!(rank.best.record.objective, min);
        assert!(rank.best.w.iter().chain(rank.best.h.iter()).all(|&x| x >= 0.0));
        assert_eq!(rank.runs.len(), 6);
        assert!(rank.runs.iter().enumerate().all(|(i, r)| r.run == i));
    }

    #[test]
    fn random_vcol_initialization_is_nonnegative() {
        let v = two_pattern_matrix();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let (w, h) = initialize(&v, 2, Initialization::RandomVcol, &mut rng);
        assert_eq!(w.dim(), (4, 2));
        assert_eq!(h.dim(), (2, 40));
        assert!(w.iter().chain(h.iter()).all(|&x| x > 0.0));
    }

    #[test]
    fn cancelled_engine_returns_cancelled() {
        let v = two_pattern_matrix();
        let engine =
            NmfEngine::new(NmfConfig { rank_range: (1, 2), n_runs: 4, ..NmfConfig::default() });
        engine.cancel_token().cancel();
        assert!(matches!(engine.decompose_matrix(&v), Err(SpidetError::Cancelled)));
        assert!(engine.factorize(&v, 1, 0).is_none());
    }
}
