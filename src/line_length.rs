//! Windowed line-length energy transform.
//!
//! For every window of `w` samples, hopped by `s` samples, the line length
//! is the summed absolute difference between consecutive samples:
//!
//! ```text
//! LL[c, i] = Σ_{j = i·s + 1}^{i·s + w − 1} |x[c, j] − x[c, j − 1]|
//! ```
//!
//! Only complete windows are emitted, so every channel yields
//! `floor((n − w) / s) + 1` bins and the stacked matrix stays rectangular.
//! Bin `i` is stamped with the centre of its window,
//! `t0 + (i·s + w/2) / fs`, and the energy signal is sampled at `fs / s`.
//!
//! Non-finite sample differences contribute zero, so an isolated NaN only
//! blanks the windows it falls into instead of poisoning the channel.
use ndarray::Array2;
use tracing::debug;

use crate::config::LineLengthConfig;
use crate::energy::EnergyMatrix;
use crate::error::{invalid, Result};
use crate::functions::ActivationFunction;
use crate::trace::{validate_traces, Trace};

/// Line length of a single signal with window `w` and hop `s` (in samples).
///
/// Returns an empty vector when the signal is shorter than one window.
pub fn line_length_1d(x: &[f64], w: usize, s: usize) -> Vec<f64> {
    assert!(w >= 2 && s >= 1, "window must be >= 2 samples and step >= 1");
    if x.len() < w {
        return vec![];
    }
    // Prefix sums of |Δx|: cum[j] = Σ_{m=1}^{j} |x[m] − x[m−1]|.
    let mut cum = Vec::with_capacity(x.len());
    cum.push(0.0_f64);
    let mut acc = 0.0_f64;
    for pair in x.windows(2) {
        let d = (pair[1] - pair[0]).abs();
        if d.is_finite() {
            acc += d;
        }
        cum.push(acc);
    }
    let n_bins = (x.len() - w) / s + 1;
    (0..n_bins)
        .map(|i| {
            let start = i * s;
            (cum[start + w - 1] - cum[start]).max(0.0)
        })
        .collect()
}

/// Apply the line-length transform to every trace and stack the result.
///
/// # Errors
///
/// [`crate::SpidetError::InvalidInput`] when the traces are empty, disagree
/// on sample rate or length, or are shorter than one window.
pub fn line_length(traces: &[Trace], cfg: &LineLengthConfig) -> Result<EnergyMatrix> {
    cfg.validate()?;
    let (sfreq, n_samples) = validate_traces(traces)?;
    let (w, s) = cfg.samples(sfreq);
    if n_samples < w {
        invalid!(
            "traces have {n_samples} samples, fewer than one line-length window ({w} samples)"
        );
    }
    let n_bins = (n_samples - w) / s + 1;
    debug!(
        n_channels = traces.len(),
        n_samples, window = w, step = s, n_bins, "computing line length"
    );

    let mut data = Array2::<f64>::zeros((traces.len(), n_bins));
    for (mut row, tr) in data.rows_mut().into_iter().zip(traces) {
        let ll = line_length_1d(&tr.data, w, s);
        row.assign(&ndarray::ArrayView1::from(&ll));
    }

    let rate = sfreq / s as f64;
    let start = traces[0].start_timestamp + (w as f64 / 2.0) / sfreq;
    let names = traces.iter().map(|t| t.label.clone()).collect();
    EnergyMatrix::new(data, names, rate, start)
}

/// Standard deviation across channels of every energy bin (ddof = 0).
///
/// A single detection function that rises whenever channels disagree in
/// energy, useful as a baseline against the NMF activations.
pub fn std_line_length(energy: &EnergyMatrix, id_prefix: &str) -> ActivationFunction {
    let data = energy.data();
    let n_ch = data.nrows() as f64;
    let values = data
        .columns()
        .into_iter()
        .map(|col| {
            let mean = col.sum() / n_ch;
            let var = col.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n_ch;
            var.sqrt()
        })
        .collect();
    ActivationFunction {
        label: "Std Line Length".to_string(),
        unique_id: format!("{id_prefix}_std_line_length"),
        rank: 0,
        sfreq: energy.sfreq(),
        start_timestamp: energy.start_timestamp(),
        data: values,
    }
}
