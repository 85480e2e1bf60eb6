//! Choosing which rank(s) of a search reach the consolidator.
//!
//! Every policy only considers usable ranks and breaks ties toward the
//! smaller rank.  An empty selection is an error.
use crate::config::RankPolicy;
use crate::error::{Result, SpidetError};

use super::RankResult;

/// A rank-selection policy.
pub trait RankSelector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Indices into `ranks` of the selected results, in rank order.
    ///
    /// # Errors
    ///
    /// [`SpidetError::NoUsableRank`] if no usable rank is present.
    fn select(&self, ranks: &[RankResult]) -> Result<Vec<usize>>;
}

/// Build the selector for `policy`.
pub fn selector_for(policy: RankPolicy) -> Box<dyn RankSelector> {
    match policy {
        RankPolicy::All => Box::new(AllRanks),
        RankPolicy::LowestError => Box::new(LowestError),
        RankPolicy::Stability => Box::new(Stability),
        RankPolicy::ConsensusCdf => Box::new(ConsensusCdf),
    }
}

fn no_usable_rank(ranks: &[RankResult]) -> SpidetError {
    let k_min = ranks.iter().map(|r| r.rank).min().unwrap_or(0);
    let k_max = ranks.iter().map(|r| r.rank).max().unwrap_or(0);
    SpidetError::NoUsableRank { k_min, k_max }
}

/// Usable rank maximising `score`; the first (smallest rank) wins ties.
fn best_by(ranks: &[RankResult], score: impl Fn(&RankResult) -> f64) -> Result<Vec<usize>> {
    let mut order: Vec<usize> = (0..ranks.len()).filter(|&i| ranks[i].is_usable()).collect();
    order.sort_by_key(|&i| ranks[i].rank);
    let mut best: Option<(usize, f64)> = None;
    for i in order {
        let s = score(&ranks[i]);
        let s = if s.is_nan() { f64::NEG_INFINITY } else { s };
        if best.map_or(true, |(_, b)| s > b) {
            best = Some((i, s));
        }
    }
    best.map(|(i, _)| vec![i]).ok_or_else(|| no_usable_rank(ranks))
}

/// Every usable rank.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllRanks;

impl RankSelector for AllRanks {
    fn name(&self) -> &'static str {
        "all"
    }

    fn select(&self, ranks: &[RankResult]) -> Result<Vec<usize>> {
        let mut picked: Vec<usize> = (0..ranks.len()).filter(|&i| ranks[i].is_usable()).collect();
        if picked.is_empty() {
            return Err(no_usable_rank(ranks));
        }
        picked.sort_by_key(|&i| ranks[i].rank);
        Ok(picked)
    }
}

/// Smallest relative residual of the best run.
#[derive(Debug, Clone, Copy, Default)]
pub struct LowestError;

impl RankSelector for LowestError {
    fn name(&self) -> &'static str {
        "lowest_error"
    }

    fn select(&self, ranks: &[RankResult]) -> Result<Vec<usize>> {
        best_by(ranks, |r| -r.best.record.relative_residual)
    }
}

/// Highest cophenetic correlation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stability;

impl RankSelector for Stability {
    fn name(&self) -> &'static str {
        "stability"
    }

    fn select(&self, ranks: &[RankResult]) -> Result<Vec<usize>> {
        best_by(ranks, |r| r.cophenetic)
    }
}

/// Largest relative gain `Δk` of the consensus-CDF area.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsensusCdf;

impl RankSelector for ConsensusCdf {
    fn name(&self) -> &'static str {
        "consensus_cdf"
    }

    fn select(&self, ranks: &[RankResult]) -> Result<Vec<usize>> {
        best_by(ranks, |r| r.delta_k)
    }
}
