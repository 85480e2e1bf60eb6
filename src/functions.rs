//! Basis and activation functions, the durable output of the decomposition.
//!
//! A [`BasisFunction`] is one column of W: how strongly each channel takes
//! part in a pattern.  An [`ActivationFunction`] is the matching row of H:
//! when, and how strongly, that pattern is expressed.  Both are immutable
//! once built and carry enough metadata to be used on their own.
use serde::{Deserialize, Serialize};

/// Spatial weighting of the channels for one discovered pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasisFunction {
    /// Short label, `W0`, `W1`, ...
    pub label: String,
    /// Label unique across a recording, e.g. `patient07_W0`.
    pub unique_id: String,
    /// Rank of the factorization this pattern came from.
    pub rank: usize,
    /// One label per entry of `data`.
    pub channel_names: Vec<String>,
    /// Non-negative channel weights.
    pub data: Vec<f64>,
}

impl BasisFunction {
    /// The channel with the largest weight.
    pub fn dominant_channel(&self) -> Option<&str> {
        self.data
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| self.channel_names[i].as_str())
    }
}

/// Time course of one pattern on an absolute time axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationFunction {
    /// Short label, `H0`, `H1`, ...
    pub label: String,
    /// Label unique across a recording, e.g. `patient07_H0`.
    pub unique_id: String,
    /// Rank of the factorization this activation came from (`0` when the
    /// signal did not come out of NMF, e.g. the std line length).
    pub rank: usize,
    /// Sampling rate of `data` in Hz.
    pub sfreq: f64,
    /// Timestamp of `data[0]`, seconds since the Unix epoch.
    pub start_timestamp: f64,
    pub data: Vec<f64>,
}

impl ActivationFunction {
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Absolute timestamp of sample `idx`.
    #[inline]
    pub fn time_at(&self, idx: usize) -> f64 {
        self.start_timestamp + idx as f64 / self.sfreq
    }

    /// Absolute timestamp of every sample.
    pub fn times(&self) -> Vec<f64> {
        (0..self.data.len()).map(|i| self.time_at(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn times_follow_rate_and_start() {
        let af = ActivationFunction {
            label: "H0".into(),
            unique_id: "x_H0".into(),
            rank: 2,
            sfreq: 50.0,
            start_timestamp: 100.0,
            data: vec![0.0; 4],
        };
        let t = af.times();
        approx::assert_abs_diff_eq!(t[0], 100.0);
        approx::assert_abs_diff_eq!(t[3], 100.06, epsilon = 1e-12);
    }

    #[test]
    fn dominant_channel_is_argmax() {
        let bf = BasisFunction {
            label: "W0".into(),
            unique_id: "x_W0".into(),
            rank: 2,
            channel_names: vec!["a".into(), "b".into(), "c".into()],
            data: vec![0.1, 0.9, 0.3],
        };
        assert_eq!(bf.dominant_channel(), Some("b"));
    }
}
