//! # spidet — NMF-based spike detection for intracranial EEG
//!
//! `spidet` finds interictal epileptiform discharges in multichannel iEEG by
//! decomposing a line-length energy representation of the recording with
//! nonnegative matrix factorization.  Every stage is usable on its own and
//! the whole chain is one call to [`detect_spikes`].
//!
//! ## Pipeline overview
//!
//! ```text
//! &[Trace]                   C channels, common rate and length
//!   │
//!   ├─ line_length()         windowed Σ|Δx|, 40 ms / 20 ms → [C, T] energy
//!   ├─ normalize_rows()      optional per-channel L2 normalisation
//!   ├─ NmfEngine             k ∈ [k_min, k_max] × n_runs seeded runs,
//!   │                          best run per rank + consensus statistics
//!   ├─ RankSelector          which rank(s) to keep (RankPolicy)
//!   ├─ ActivationConsolidator  W columns / H rows → labelled functions
//!   └─ ThresholdGenerator    median + 5·σ̂ → SpikeEvents per activation
//!        │
//!        └─→ DetectionOutput
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use spidet::{detect_spikes, DetectionConfig, NmfConfig, Trace};
//!
//! let traces: Vec<Trace> = (0..4)
//!     .map(|c| {
//!         let x = (0..10_000).map(|t| ((t * (c + 1)) as f64 * 0.01).sin()).collect();
//!         Trace::new(format!("LA{c}"), x, 500.0, 0.0)
//!     })
//!     .collect();
//! let cfg = DetectionConfig {
//!     nmf: NmfConfig { rank_range: (2, 3), n_runs: 20, ..NmfConfig::default() },
//!     ..DetectionConfig::default()
//! };
//! let out = detect_spikes(&traces, &cfg).unwrap();
//! for (af, events) in out.activations().zip(&out.events) {
//!     println!("{}: {} events", af.unique_id, events.len());
//! }
//! ```
//!
//! ## Running individual steps
//!
//! ```no_run
//! use spidet::{line_length, ActivationConsolidator, LineLengthConfig, NmfConfig, NmfEngine,
//!              ThresholdConfig, ThresholdGenerator, Trace};
//!
//! # let traces: Vec<Trace> = vec![];
//! let energy = line_length(&traces, &LineLengthConfig::default()).unwrap();
//! let engine = NmfEngine::new(NmfConfig { rank_range: (3, 3), ..NmfConfig::default() });
//! let decomposition = engine.decompose(&energy).unwrap();
//! let rank = ActivationConsolidator::new("rec")
//!     .consolidate(&decomposition.ranks[0].best, &energy, false)
//!     .unwrap();
//! let generator = ThresholdGenerator::new(ThresholdConfig::default());
//! let events = generator.detect(&rank.activations[0]).unwrap();
//! // Re-score with a fixed threshold, no NMF involved.
//! let strict = generator.find_events(&rank.activations[0], 2.0).unwrap();
//! ```
//!
//! Stages log through `tracing`; binaries install a subscriber with
//! [`logging::init_tracing`].  With the default `parallel` feature the NMF
//! runs are spread over the rayon pool.

pub mod config;
pub mod consolidate;
pub mod energy;
pub mod error;
pub mod functions;
pub mod io;
pub mod line_length;
pub mod logging;
pub mod nmf;
pub mod parallel;
pub mod threshold;
pub mod trace;

use serde::Serialize;
use tracing::info;

// ── Crate-root re-exports ─────────────────────────────────────────────────

// config
pub use config::{
    DetectionConfig, Initialization, LineLengthConfig, NmfConfig, Objective, RankPolicy,
    SparseFactor, ThresholdConfig,
};

// data model
pub use energy::EnergyMatrix;
pub use functions::{ActivationFunction, BasisFunction};
pub use trace::{validate_traces, Trace};

// errors
pub use error::{Result, SpidetError};

// stages
pub use consolidate::{ActivationConsolidator, ConsolidatedRank};
pub use line_length::{line_length, line_length_1d, std_line_length};
pub use nmf::{
    selector_for, CancelToken, ConvergenceWarning, Decomposition, Factorization, NmfEngine,
    RankResult, RankSelector, RankStatus, RankSummary, RunRecord, RunStatus,
};
pub use threshold::{detect_all, robust_threshold, SpikeEvent, ThresholdGenerator};

/// Everything [`detect_spikes`] produces.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionOutput {
    /// Rate of the energy signal and of every activation function (Hz).
    pub energy_rate: f64,
    /// One summary per searched rank, in rank order.
    pub ranks: Vec<RankSummary>,
    /// Diagnostics of every NMF run.
    pub runs: Vec<RunRecord>,
    pub warnings: Vec<ConvergenceWarning>,
    /// Consolidated components of the rank(s) chosen by the rank policy.
    pub selected: Vec<ConsolidatedRank>,
    /// `events[i]` belongs to the `i`-th activation of
    /// [`DetectionOutput::activations`].
    pub events: Vec<Vec<SpikeEvent>>,
    /// Standard deviation of the energy across channels.
    pub std_line_length: ActivationFunction,
}

impl DetectionOutput {
    /// Activation functions of all selected ranks, rank by rank.
    pub fn activations(&self) -> impl Iterator<Item = &ActivationFunction> {
        self.selected.iter().flat_map(|r| r.activations.iter())
    }

    pub fn basis(&self) -> impl Iterator<Item = &BasisFunction> {
        self.selected.iter().flat_map(|r| r.basis.iter())
    }

    pub fn n_events(&self) -> usize {
        self.events.iter().map(Vec::len).sum()
    }
}

/// Run the **full detection pipeline** on one recording.
///
/// # Pipeline steps
///
/// 1. Line-length transform of every trace ([`DetectionConfig::line_length`]).
/// 2. Std line length across channels (kept as a reference signal).
/// 3. Optional L2 normalisation of each energy row ([`DetectionConfig::normalize_rows`]).
/// 4. NMF rank search ([`DetectionConfig::nmf`]).
/// 5. Rank selection ([`DetectionConfig::rank_policy`]).
/// 6. Consolidation into labelled basis / activation functions.
/// 7. Thresholding of every selected activation ([`DetectionConfig::threshold`]).
///
/// # Errors
///
/// A [`SpidetError::Stage`] naming the failing stage and its parameters;
/// [`SpidetError::root`] gives the underlying error.  Runs that hit the
/// iteration cap are not errors; they show up in
/// [`DetectionOutput::warnings`].
pub fn detect_spikes(traces: &[Trace], cfg: &DetectionConfig) -> Result<DetectionOutput> {
    detect_spikes_with_cancel(traces, cfg, CancelToken::new())
}

/// [`detect_spikes`] with a token that can abort the NMF stage.
pub fn detect_spikes_with_cancel(
    traces: &[Trace],
    cfg: &DetectionConfig,
    cancel: CancelToken,
) -> Result<DetectionOutput> {
    cfg.validate().map_err(|e| e.in_stage("config", "DetectionConfig"))?;

    // 1–3. Energy.
    let energy = line_length(traces, &cfg.line_length).map_err(|e| {
        e.in_stage(
            "line_length",
            format!(
                "window={}s step={}s channels={}",
                cfg.line_length.window,
                cfg.line_length.step,
                traces.len()
            ),
        )
    })?;
    let std_ll = std_line_length(&energy, &cfg.id_prefix);
    let nmf_input = if cfg.normalize_rows { energy.normalize_rows() } else { energy };

    // 4. Rank search.
    let nmf = &cfg.nmf;
    let engine = NmfEngine::new(nmf.clone()).with_cancel_token(cancel);
    let decomposition = engine.decompose(&nmf_input).map_err(|e| {
        e.in_stage(
            "nmf",
            format!(
                "rank_range={:?} n_runs={} sparseness={:?} seed={}",
                nmf.rank_range, nmf.n_runs, nmf.sparseness, nmf.seed
            ),
        )
    })?;

    // 5. Rank policy.
    let selector = selector_for(cfg.rank_policy);
    let chosen = selector
        .select(&decomposition.ranks)
        .map_err(|e| e.in_stage("rank_selection", format!("policy={}", selector.name())))?;
    info!(
        policy = selector.name(),
        ranks = ?chosen.iter().map(|&i| decomposition.ranks[i].rank).collect::<Vec<_>>(),
        "ranks selected"
    );

    // 6. Consolidation.
    let selected = ActivationConsolidator::new(cfg.id_prefix.as_str())
        .consolidate_ranks(&decomposition, &chosen, &nmf_input)
        .map_err(|e| e.in_stage("consolidate", format!("id_prefix={}", cfg.id_prefix)))?;

    // 7. Thresholding.
    let activations: Vec<ActivationFunction> =
        selected.iter().flat_map(|r| r.activations.iter().cloned()).collect();
    let events = detect_all(&activations, &cfg.threshold)?;

    let out = DetectionOutput {
        energy_rate: nmf_input.sfreq(),
        ranks: decomposition.summaries(),
        runs: decomposition.run_records().cloned().collect(),
        warnings: decomposition.ranks.iter().flat_map(|r| r.warnings.iter().cloned()).collect(),
        selected,
        events,
        std_line_length: std_ll,
    };
    info!(
        activations = activations.len(),
        events = out.n_events(),
        warnings = out.warnings.len(),
        "detection finished"
    );
    Ok(out)
}
