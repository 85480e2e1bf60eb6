//! Detection configuration.
//!
//! [`DetectionConfig`] holds every tunable parameter of the full pipeline and
//! is split into one sub-config per stage so each stage can also be driven on
//! its own.  All fields have documented defaults and are `pub`, so a config
//! is usually built with struct-update syntax:
//!
//! ```
//! use spidet::{DetectionConfig, NmfConfig};
//!
//! let cfg = DetectionConfig {
//!     nmf: NmfConfig { n_runs: 20, rank_range: (2, 4), ..NmfConfig::default() },
//!     ..DetectionConfig::default()
//! };
//! assert_eq!(cfg.nmf.n_runs, 20);
//! ```
//!
//! Every struct derives `serde` traits; missing fields in a JSON file fall
//! back to the defaults.
use serde::{Deserialize, Serialize};

use crate::error::{invalid, Result};

// ── Line length ──────────────────────────────────────────────────────────────

/// Parameters of the line-length energy transform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineLengthConfig {
    /// Window length in seconds.
    ///
    /// Converted to `max(2, round(window · fs))` samples.
    ///
    /// Default: `0.040` s.
    pub window: f64,

    /// Hop between consecutive windows in seconds.
    ///
    /// Converted to `max(1, round(step · fs))` samples; the energy signal is
    /// sampled at `fs / step_samples`.  At the default this gives a 50 Hz
    /// energy signal for any input rate that is a multiple of 50 Hz.
    ///
    /// Default: `0.020` s.
    pub step: f64,
}

impl Default for LineLengthConfig {
    fn default() -> Self {
        Self { window: 0.040, step: 0.020 }
    }
}

impl LineLengthConfig {
    /// `(window, step)` in samples at sample rate `sfreq`.
    pub fn samples(&self, sfreq: f64) -> (usize, usize) {
        let w = ((self.window * sfreq).round() as usize).max(2);
        let s = ((self.step * sfreq).round() as usize).max(1);
        (w, s)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.window.is_finite() && self.window > 0.0) {
            invalid!("line-length window must be positive, got {}", self.window);
        }
        if !(self.step.is_finite() && self.step > 0.0) {
            invalid!("line-length step must be positive, got {}", self.step);
        }
        Ok(())
    }
}

// ── NMF ──────────────────────────────────────────────────────────────────────

/// Reconstruction objective minimised by the multiplicative updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    /// Squared Frobenius norm `‖V − WH‖²`.
    #[default]
    Euclidean,
    /// Generalised Kullback–Leibler divergence `D(V ‖ WH)`.
    KullbackLeibler,
}

/// How W and H are seeded before the first update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Initialization {
    /// Uniform values in `(0, sqrt(mean(V) / k)]` for both factors.
    #[default]
    Random,
    /// Each W column is the mean of a random subset of V's columns
    /// (a fifth of them); H is uniform random.
    RandomVcol,
}

/// Factor that carries the sparseness constraint when one is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SparseFactor {
    /// Columns of W (spatial patterns).
    #[default]
    Basis,
    /// Rows of H (activation time series).
    Activation,
}

/// Parameters of the NMF rank search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NmfConfig {
    /// Inclusive range of ranks `(k_min, k_max)` to factorize.
    ///
    /// Default: `(2, 5)`.
    pub rank_range: (usize, usize),

    /// Independent randomly initialised runs per rank.
    ///
    /// Default: `100`.
    pub n_runs: usize,

    /// Iteration cap of a single run.
    ///
    /// Default: `500`.
    pub max_iter: usize,

    /// Relative objective change below which a run counts as converged.
    ///
    /// Default: `1e-5`.
    pub tol: f64,

    /// Target sparseness in `[0, 1]` (Hoyer's measure).  `None` selects the
    /// unconstrained multiplicative updates.
    ///
    /// Default: `None`.
    pub sparseness: Option<f64>,

    /// Which factor the sparseness target applies to.
    ///
    /// Default: [`SparseFactor::Basis`].
    pub sparse_factor: SparseFactor,

    /// Default: [`Objective::Euclidean`].
    pub objective: Objective,

    /// Default: [`Initialization::Random`].
    pub init: Initialization,

    /// Largest acceptable relative residual `‖V − WH‖ / ‖V‖`.  Runs above it
    /// (or with a non-finite objective) are kept as diagnostics but only
    /// selected when a rank has nothing better.
    ///
    /// Default: `1.0` (no better than the zero factorization).
    pub sanity_floor: f64,

    /// Base seed; run `r` of rank `k` derives its own stream from
    /// `(seed, k, r)`.
    ///
    /// Default: `42`.
    pub seed: u64,
}

impl Default for NmfConfig {
    fn default() -> Self {
        Self {
            rank_range: (2, 5),
            n_runs: 100,
            max_iter: 500,
            tol: 1e-5,
            sparseness: None,
            sparse_factor: SparseFactor::Basis,
            objective: Objective::Euclidean,
            init: Initialization::Random,
            sanity_floor: 1.0,
            seed: 42,
        }
    }
}

impl NmfConfig {
    /// Checks the run parameters.  Rank bounds are checked against the
    /// matrix by the engine.
    pub fn validate(&self) -> Result<()> {
        if self.n_runs == 0 {
            invalid!("n_runs must be a positive integer");
        }
        if self.max_iter == 0 {
            invalid!("max_iter must be a positive integer");
        }
        if !(self.tol.is_finite() && self.tol > 0.0) {
            invalid!("tol must be positive, got {}", self.tol);
        }
        if let Some(s) = self.sparseness {
            if !(0.0..=1.0).contains(&s) {
                invalid!("sparseness must lie in [0, 1], got {s}");
            }
        }
        if !(self.sanity_floor.is_finite() && self.sanity_floor > 0.0) {
            invalid!("sanity_floor must be positive, got {}", self.sanity_floor);
        }
        Ok(())
    }
}

// ── Rank policy ──────────────────────────────────────────────────────────────

/// Which rank(s) are handed to the consolidator after the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankPolicy {
    /// Consolidate every usable rank.
    All,
    /// The usable rank with the smallest relative residual.
    LowestError,
    /// The usable rank with the highest cophenetic correlation.
    Stability,
    /// The usable rank with the largest relative gain in consensus-CDF area.
    #[default]
    ConsensusCdf,
}

// ── Threshold ────────────────────────────────────────────────────────────────

/// Parameters of the threshold generator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Multiplier of the robust standard deviation added to the median.
    ///
    /// Default: `5.0`.
    pub scale: f64,

    /// Events shorter than this (seconds) are discarded.
    ///
    /// Default: `0.0` s (keep everything).
    pub min_duration: f64,

    /// Events separated by a gap shorter than this (seconds) are merged.
    ///
    /// Default: `0.0` s (never merge).
    pub min_gap: f64,

    /// Discard events touching the first or last sample.
    ///
    /// Default: `false`.
    pub drop_boundary_events: bool,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            scale: 5.0,
            min_duration: 0.0,
            min_gap: 0.0,
            drop_boundary_events: false,
        }
    }
}

impl ThresholdConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.scale.is_finite() && self.scale >= 0.0) {
            invalid!("threshold scale must be non-negative, got {}", self.scale);
        }
        if !(self.min_duration.is_finite() && self.min_duration >= 0.0) {
            invalid!("min_duration must be non-negative, got {}", self.min_duration);
        }
        if !(self.min_gap.is_finite() && self.min_gap >= 0.0) {
            invalid!("min_gap must be non-negative, got {}", self.min_gap);
        }
        Ok(())
    }
}

/// Convert a duration in seconds to a sample count at rate `sfreq`,
/// rounding up so that e.g. 0.1 s at 50 Hz needs 5 samples.
pub(crate) fn seconds_to_samples(seconds: f64, sfreq: f64) -> usize {
    (seconds * sfreq - 1e-9).ceil().max(0.0) as usize
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

/// Configuration of [`crate::detect_spikes`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub line_length: LineLengthConfig,
    pub nmf: NmfConfig,
    pub threshold: ThresholdConfig,

    /// Default: [`RankPolicy::ConsensusCdf`].
    pub rank_policy: RankPolicy,

    /// L2-normalise every channel of the energy matrix before NMF.
    ///
    /// Default: `true`.
    pub normalize_rows: bool,

    /// Prefix of the unique ids given to basis and activation functions.
    ///
    /// Default: `"spidet"`.
    pub id_prefix: String,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            line_length: LineLengthConfig::default(),
            nmf: NmfConfig::default(),
            threshold: ThresholdConfig::default(),
            rank_policy: RankPolicy::default(),
            normalize_rows: true,
            id_prefix: "spidet".to_string(),
        }
    }
}

impl DetectionConfig {
    pub fn validate(&self) -> Result<()> {
        self.line_length.validate()?;
        self.nmf.validate()?;
        self.threshold.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_line_length_is_50hz_at_500hz() {
        let cfg = LineLengthConfig::default();
        assert_eq!(cfg.samples(500.0), (20, 10));
        assert_eq!(cfg.samples(1000.0), (40, 20));
    }

    #[test]
    fn tiny_window_clamped() {
        let cfg = LineLengthConfig { window: 1e-6, step: 1e-6 };
        assert_eq!(cfg.samples(100.0), (2, 1));
    }

    #[test]
    fn seconds_round_up() {
        assert_eq!(seconds_to_samples(0.1, 50.0), 5);
        assert_eq!(seconds_to_samples(2.0, 1.0), 2);
        assert_eq!(seconds_to_samples(0.0, 50.0), 0);
        assert_eq!(seconds_to_samples(0.11, 50.0), 6);
    }

    #[test]
    fn sparseness_out_of_range_rejected() {
        let cfg = NmfConfig { sparseness: Some(1.5), ..NmfConfig::default() };
        assert!(cfg.validate().is_err());
        let cfg = NmfConfig { n_runs: 0, ..NmfConfig::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let cfg: DetectionConfig =
            serde_json::from_str(r#"{"nmf": {"n_runs": 7}, "rank_policy": "stability"}"#).unwrap();
        assert_eq!(cfg.nmf.n_runs, 7);
        assert_eq!(cfg.nmf.rank_range, (2, 5));
        assert_eq!(cfg.rank_policy, RankPolicy::Stability);
        assert!(cfg.normalize_rows);
    }
}
