//! Robust thresholding of activation functions and event extraction.
//!
//! ## Threshold
//!
//! ```text
//! threshold = median(x) + scale · σ̂
//! σ̂         = 1.4826 · median(|x − median(x)|)          (MAD)
//!           = 1.2533 · mean(|x − median(x)|)            (if the MAD is 0)
//! ```
//!
//! Both dispersion estimates are scaled to match the standard deviation of a
//! normal distribution.  The fallback covers signals that sit at one value
//! more than half of the time, which is common for sparse activations.
//!
//! ## Events
//!
//! Maximal runs of samples strictly above the threshold are found first.
//! Runs whose gap (samples between the end of one and the start of the next)
//! is smaller than `min_gap` are merged, then events shorter than
//! `min_duration` are dropped.  Runs touching either end of the signal are
//! kept unless `drop_boundary_events` is set.
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{seconds_to_samples, ThresholdConfig};
use crate::error::{invalid, Result, SpidetError};
use crate::functions::ActivationFunction;

/// Consistency constant of the MAD for normal data.
pub const MAD_TO_SIGMA: f64 = 1.4826;
/// Consistency constant of the mean absolute deviation for normal data.
pub const MEAN_AD_TO_SIGMA: f64 = 1.2533;

/// One detected above-threshold excursion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeEvent {
    /// Label of the activation function the event was found in.
    pub label: String,
    /// First sample above threshold.
    pub start_index: usize,
    /// One past the last sample of the event.
    pub end_index: usize,
    /// Absolute time of `start_index`.
    pub start_time: f64,
    /// Absolute time of `end_index`.
    pub end_time: f64,
    /// `end_time − start_time` in seconds.
    pub duration: f64,
    pub peak_value: f64,
    pub peak_time: f64,
    /// Threshold the event was extracted with.
    pub threshold: f64,
}

impl SpikeEvent {
    #[inline]
    pub fn n_samples(&self) -> usize {
        self.end_index - self.start_index
    }

    /// Whether the event shares at least one sample with `[start, end)`.
    #[inline]
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        self.start_index < end && start < self.end_index
    }
}

fn median_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        0.5 * (sorted[n / 2 - 1] + sorted[n / 2])
    }
}

/// `median + scale · σ̂` over the finite samples of `x`, `None` if there are
/// none.
pub fn robust_threshold(x: &[f64], scale: f64) -> Option<f64> {
    let mut v: Vec<f64> = x.iter().copied().filter(|s| s.is_finite()).collect();
    if v.is_empty() {
        return None;
    }
    v.sort_by(f64::total_cmp);
    let med = median_sorted(&v);

    let mut dev: Vec<f64> = v.iter().map(|s| (s - med).abs()).collect();
    dev.sort_by(f64::total_cmp);
    let mad = median_sorted(&dev);
    let sigma = if mad > 0.0 {
        MAD_TO_SIGMA * mad
    } else {
        MEAN_AD_TO_SIGMA * dev.iter().sum::<f64>() / dev.len() as f64
    };
    Some(med + scale * sigma)
}

/// Maximal `[start, end)` runs of `x > threshold`.
fn above_runs(x: &[f64], threshold: f64) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut start = None;
    for (i, &s) in x.iter().enumerate() {
        match (s > threshold, start) {
            (true, None) => start = Some(i),
            (false, Some(st)) => {
                runs.push((st, i));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(st) = start {
        runs.push((st, x.len()));
    }
    runs
}

/// Merge runs separated by fewer than `min_gap` samples.
fn merge_close(runs: Vec<(usize, usize)>, min_gap: usize) -> Vec<(usize, usize)> {
    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(runs.len());
    for (start, end) in runs {
        match merged.last_mut() {
            Some(last) if start - last.1 < min_gap => last.1 = end,
            _ => merged.push((start, end)),
        }
    }
    merged
}

/// Threshold computation and event extraction for activation functions.
#[derive(Debug, Clone, Default)]
pub struct ThresholdGenerator {
    cfg: ThresholdConfig,
}

impl ThresholdGenerator {
    pub fn new(cfg: ThresholdConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &ThresholdConfig {
        &self.cfg
    }

    /// The robust threshold of `af`.
    ///
    /// # Errors
    ///
    /// [`SpidetError::EmptySignal`] for a zero-length signal,
    /// [`SpidetError::InvalidInput`] if it has no finite sample or the
    /// configuration is invalid.
    pub fn generate_threshold(&self, af: &ActivationFunction) -> Result<f64> {
        self.cfg.validate()?;
        if af.is_empty() {
            return Err(SpidetError::EmptySignal);
        }
        match robust_threshold(&af.data, self.cfg.scale) {
            Some(t) => Ok(t),
            None => invalid!("activation function {} has no finite samples", af.label),
        }
    }

    /// Events of `af` above a caller-supplied `threshold`.
    ///
    /// Nothing is recomputed besides the scan, so re-scoring a stored
    /// activation function with the same threshold always yields the same
    /// events.
    ///
    /// # Errors
    ///
    /// [`SpidetError::EmptySignal`] for a zero-length signal,
    /// [`SpidetError::InvalidInput`] for a non-finite threshold, a
    /// non-positive sample rate or an invalid configuration.
    pub fn find_events(&self, af: &ActivationFunction, threshold: f64) -> Result<Vec<SpikeEvent>> {
        self.cfg.validate()?;
        if af.is_empty() {
            return Err(SpidetError::EmptySignal);
        }
        if !threshold.is_finite() {
            invalid!("threshold must be finite, got {threshold}");
        }
        if !(af.sfreq.is_finite() && af.sfreq > 0.0) {
            invalid!("activation function {} has sample rate {}", af.label, af.sfreq);
        }

        let n = af.len();
        let min_gap = seconds_to_samples(self.cfg.min_gap, af.sfreq);
        let min_len = seconds_to_samples(self.cfg.min_duration, af.sfreq);

        let runs = merge_close(above_runs(&af.data, threshold), min_gap);
        let events: Vec<SpikeEvent> = runs
            .into_iter()
            .filter(|&(s, e)| e - s >= min_len)
            .filter(|&(s, e)| !(self.cfg.drop_boundary_events && (s == 0 || e == n)))
            .map(|(s, e)| self.event(af, s, e, threshold))
            .collect();
        debug!(label = %af.label, threshold, events = events.len(), "extracted events");
        Ok(events)
    }

    fn event(
        &self,
        af: &ActivationFunction,
        start: usize,
        end: usize,
        threshold: f64,
    ) -> SpikeEvent {
        // Merged events can contain sub-threshold or NaN samples; the peak
        // is taken over the finite ones.
        let mut peak = start;
        for i in start..end {
            if af.data[i] > af.data[peak] || !af.data[peak].is_finite() {
                peak = i;
            }
        }
        let start_time = af.time_at(start);
        let end_time = af.time_at(end);
        SpikeEvent {
            label: af.label.clone(),
            start_index: start,
            end_index: end,
            start_time,
            end_time,
            duration: end_time - start_time,
            peak_value: af.data[peak],
            peak_time: af.time_at(peak),
            threshold,
        }
    }

    /// [`ThresholdGenerator::find_events`] at the generated threshold.
    pub fn detect(&self, af: &ActivationFunction) -> Result<Vec<SpikeEvent>> {
        let threshold = self.generate_threshold(af)?;
        self.find_events(af, threshold)
    }
}

/// Detect events in each activation function; `result[i]` belongs to
/// `afs[i]`.
///
/// # Errors
///
/// The first failing function's error, wrapped with its label.
pub fn detect_all(
    afs: &[ActivationFunction],
    cfg: &ThresholdConfig,
) -> Result<Vec<Vec<SpikeEvent>>> {
    let generator = ThresholdGenerator::new(*cfg);
    afs.iter()
        .map(|af| generator.detect(af).map_err(|e| e.in_stage("threshold", af.unique_id.clone())))
        .collect()
}
