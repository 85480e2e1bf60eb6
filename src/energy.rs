//! The stacked energy matrix fed to NMF.
//!
//! Rows are channels, columns are line-length bins.  The matrix keeps the
//! channel labels, the bin rate and the timestamp of the first bin so that
//! every function extracted from it can be placed on an absolute time axis.
use ndarray::{Array2, Axis};

use crate::error::{invalid, Result};

/// Non-negative `[C, T]` energy matrix with its timing metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyMatrix {
    data: Array2<f64>,
    channel_names: Vec<String>,
    sfreq: f64,
    start_timestamp: f64,
}

impl EnergyMatrix {
    /// Wrap `data` after checking it: one label per row, at least one
    /// column, every entry finite and `>= 0`, positive bin rate.
    pub fn new(
        data: Array2<f64>,
        channel_names: Vec<String>,
        sfreq: f64,
        start_timestamp: f64,
    ) -> Result<Self> {
        let (n_ch, n_t) = data.dim();
        if n_ch == 0 || n_t == 0 {
            invalid!("energy matrix is empty ({n_ch} x {n_t})");
        }
        if channel_names.len() != n_ch {
            invalid!("{} channel names for {n_ch} rows", channel_names.len());
        }
        if !(sfreq.is_finite() && sfreq > 0.0) {
            invalid!("energy matrix rate must be positive, got {sfreq}");
        }
        let bad = data.indexed_iter().find(|(_, v)| !(v.is_finite() && **v >= 0.0));
        if let Some(((c, t), v)) = bad {
            invalid!("energy matrix entry [{c}, {t}] = {v} is not a finite non-negative value");
        }
        Ok(Self { data, channel_names, sfreq, start_timestamp })
    }

    #[inline]
    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    #[inline]
    pub fn channel_names(&self) -> &[String] {
        &self.channel_names
    }

    /// Bin rate in Hz.
    #[inline]
    pub fn sfreq(&self) -> f64 {
        self.sfreq
    }

    /// Timestamp of the first bin (seconds since the Unix epoch).
    #[inline]
    pub fn start_timestamp(&self) -> f64 {
        self.start_timestamp
    }

    #[inline]
    pub fn n_channels(&self) -> usize {
        self.data.nrows()
    }

    #[inline]
    pub fn n_bins(&self) -> usize {
        self.data.ncols()
    }

    /// Copy with every row scaled to unit L2 norm.  All-zero rows stay zero.
    pub fn normalize_rows(&self) -> EnergyMatrix {
        let mut data = self.data.clone();
        for mut row in data.axis_iter_mut(Axis(0)) {
            let norm = row.dot(&row).sqrt();
            if norm > 0.0 {
                row.mapv_inplace(|v| v / norm);
            }
        }
        EnergyMatrix { data, ..self.clone() }
    }

    pub fn into_data(self) -> Array2<f64> {
        self.data
    }
}
