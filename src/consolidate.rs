//! From factorizations to labelled basis / activation function pairs.
//!
//! NMF solutions are only defined up to a per-component scale and a
//! permutation of the components.  The consolidator fixes both:
//!
//! 1. every W column is scaled to a maximum of 1 and the matching H row
//!    absorbs the inverse factor, so `W·H` is unchanged and activations of
//!    different components are comparable;
//! 2. components are ordered by decreasing total activation (ties keep the
//!    factorization's order), W columns and H rows moving together.
//!
//! Component `i` then becomes `W{i}` / `H{i}`.
use ndarray::Array2;
use serde::Serialize;
use tracing::debug;

use crate::energy::EnergyMatrix;
use crate::error::{invalid, Result};
use crate::functions::{ActivationFunction, BasisFunction};
use crate::nmf::{Decomposition, Factorization};

/// The labelled components of one rank.
///
/// `basis[i]` and `activations[i]` always describe the same component and
/// both lists have exactly `rank` entries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsolidatedRank {
    pub rank: usize,
    pub basis: Vec<BasisFunction>,
    pub activations: Vec<ActivationFunction>,
}

impl ConsolidatedRank {
    /// Components as `(basis, activation)` pairs.
    pub fn pairs(&self) -> impl Iterator<Item = (&BasisFunction, &ActivationFunction)> {
        self.basis.iter().zip(&self.activations)
    }

    /// `[channels, rank]` matrix of the basis functions.
    pub fn w(&self) -> Array2<f64> {
        let n_ch = self.basis.first().map_or(0, |b| b.data.len());
        Array2::from_shape_fn((n_ch, self.basis.len()), |(c, a)| self.basis[a].data[c])
    }

    /// `[rank, bins]` matrix of the activation functions.
    pub fn h(&self) -> Array2<f64> {
        let n_t = self.activations.first().map_or(0, |h| h.data.len());
        Array2::from_shape_fn((self.activations.len(), n_t), |(a, t)| self.activations[a].data[t])
    }
}

/// Builds [`ConsolidatedRank`]s from factorizations of an [`EnergyMatrix`].
#[derive(Debug, Clone)]
pub struct ActivationConsolidator {
    id_prefix: String,
}

impl ActivationConsolidator {
    /// `id_prefix` starts every unique id, e.g. `patient07` gives `patient07_H0`.
    pub fn new(id_prefix: impl Into<String>) -> Self {
        Self { id_prefix: id_prefix.into() }
    }

    pub fn id_prefix(&self) -> &str {
        &self.id_prefix
    }

    /// Consolidate one factorization.
    ///
    /// With `tag_rank` the unique ids carry the rank (`prefix_k3_H0`), which
    /// keeps them distinct when several ranks of one recording are kept.
    ///
    /// # Errors
    ///
    /// [`crate::SpidetError::InvalidInput`] if the factor shapes do not match
    /// `energy`.
    pub fn consolidate(
        &self,
        f: &Factorization,
        energy: &EnergyMatrix,
        tag_rank: bool,
    ) -> Result<ConsolidatedRank> {
        let k = f.rank;
        if f.w.dim() != (energy.n_channels(), k) {
            invalid!("W is {:?}, expected ({}, {k})", f.w.dim(), energy.n_channels());
        }
        if f.h.dim() != (k, energy.n_bins()) {
            invalid!("H is {:?}, expected ({k}, {})", f.h.dim(), energy.n_bins());
        }

        let mut w = f.w.clone();
        let mut h = f.h.clone();
        for a in 0..k {
            let peak = w.column(a).fold(0.0_f64, |m, &x| m.max(x));
            if peak > 0.0 {
                w.column_mut(a).mapv_inplace(|x| x / peak);
                h.row_mut(a).mapv_inplace(|x| x * peak);
            }
        }

        let totals: Vec<f64> = h.rows().into_iter().map(|row| row.sum()).collect();
        let mut order: Vec<usize> = (0..k).collect();
        order.sort_by(|&a, &b| totals[b].total_cmp(&totals[a]).then(a.cmp(&b)));

        let prefix =
            if tag_rank { format!("{}_k{k}", self.id_prefix) } else { self.id_prefix.clone() };
        let mut basis = Vec::with_capacity(k);
        let mut activations = Vec::with_capacity(k);
        for (i, &a) in order.iter().enumerate() {
            let w_label = format!("W{i}");
            let h_label = format!("H{i}");
            basis.push(BasisFunction {
                unique_id: format!("{prefix}_{w_label}"),
                label: w_label,
                rank: k,
                channel_names: energy.channel_names().to_vec(),
                data: w.column(a).to_vec(),
            });
            activations.push(ActivationFunction {
                unique_id: format!("{prefix}_{h_label}"),
                label: h_label,
                rank: k,
                sfreq: energy.sfreq(),
                start_timestamp: energy.start_timestamp(),
                data: h.row(a).to_vec(),
            });
        }
        debug!(rank = k, ?order, "consolidated components");
        Ok(ConsolidatedRank { rank: k, basis, activations })
    }

    /// Consolidate the ranks at `selected` (indices into `decomposition.ranks`).
    pub fn consolidate_ranks(
        &self,
        decomposition: &Decomposition,
        selected: &[usize],
        energy: &EnergyMatrix,
    ) -> Result<Vec<ConsolidatedRank>> {
        let tag_rank = selected.len() > 1;
        selected
            .iter()
            .map(|&i| match decomposition.ranks.get(i) {
                Some(r) => self.consolidate(&r.best, energy, tag_rank),
                None => Err(crate::SpidetError::InvalidInput(format!(
                    "rank index {i} out of range ({} ranks)",
                    decomposition.ranks.len()
                ))),
            })
            .collect()
    }
}
