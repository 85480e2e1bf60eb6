//! Per-channel input traces.
//!
//! A [`Trace`] is what the file-reading collaborator hands to the engine:
//! one channel of preprocessed samples at a known rate and start time.
use serde::{Deserialize, Serialize};

use crate::error::{invalid, Result};

/// One channel of sampled signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    /// Channel label, e.g. `"LA1-LA2"`.
    pub label: String,
    /// Samples in acquisition order.
    pub data: Vec<f64>,
    /// Sampling rate in Hz.
    pub sfreq: f64,
    /// Time of the first sample, seconds since the Unix epoch.
    pub start_timestamp: f64,
}

impl Trace {
    pub fn new(label: impl Into<String>, data: Vec<f64>, sfreq: f64, start_timestamp: f64) -> Self {
        Self { label: label.into(), data, sfreq, start_timestamp }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Recording length in seconds.
    pub fn duration(&self) -> f64 {
        self.data.len() as f64 / self.sfreq
    }
}

/// Check that `traces` form a rectangular recording: at least one trace,
/// no empty trace, one common positive sample rate and one common length.
///
/// Returns `(sfreq, n_samples)`.
pub fn validate_traces(traces: &[Trace]) -> Result<(f64, usize)> {
    let Some(first) = traces.first() else {
        invalid!("no traces supplied");
    };
    if !(first.sfreq.is_finite() && first.sfreq > 0.0) {
        invalid!("trace '{}' has invalid sample rate {}", first.label, first.sfreq);
    }
    for tr in traces {
        if tr.is_empty() {
            invalid!("trace '{}' has no samples", tr.label);
        }
        if (tr.sfreq - first.sfreq).abs() > 1e-9 * first.sfreq {
            invalid!(
                "non-uniform sample rates: '{}' at {} Hz, '{}' at {} Hz",
                first.label, first.sfreq, tr.label, tr.sfreq
            );
        }
        if tr.len() != first.len() {
            invalid!(
                "non-uniform trace lengths: '{}' has {} samples, '{}' has {}",
                first.label, first.len(), tr.label, tr.len()
            );
        }
    }
    Ok((first.sfreq, first.len()))
}
