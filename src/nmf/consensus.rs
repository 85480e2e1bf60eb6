//! Cross-run stability of the channel clustering induced by W.
//!
//! Every run assigns each channel to the component with the largest weight
//! in its W row.  Averaging the resulting channel × channel connectivity
//! matrices over all runs of a rank gives the consensus matrix; a rank whose
//! runs agree produces a consensus close to 0/1 everywhere.
//!
//! Two scores are derived from it:
//!
//! - the **cophenetic correlation** of an average-linkage clustering of
//!   `1 − consensus` (Brunet et al., 2004), and
//! - the **area under the consensus CDF** and its relative increase `Δk`
//!   between successive ranks (Monti et al., 2003), with the KL divergence
//!   `Δy` between successive CDFs next to it.
use ndarray::Array2;

/// Number of histogram bins of the consensus CDF over `[0, 1]`.
pub const CDF_BINS: usize = 100;

/// Component index with the largest weight for each row of `w`
/// (ties and all-zero rows go to the lowest index).
pub fn connectivity_labels(w: &Array2<f64>) -> Vec<usize> {
    w.rows()
        .into_iter()
        .map(|row| {
            let mut best = 0;
            for (a, &x) in row.iter().enumerate() {
                if x > row[best] {
                    best = a;
                }
            }
            best
        })
        .collect()
}

/// Mean connectivity over runs.  `labels[r][i]` is the cluster of channel
/// `i` in run `r`.
pub fn consensus_matrix(labels: &[Vec<usize>], n_channels: usize) -> Array2<f64> {
    let mut counts = Array2::<f64>::zeros((n_channels, n_channels));
    for run in labels {
        for i in 0..n_channels {
            for j in i..n_channels {
                if run[i] == run[j] {
                    counts[[i, j]] += 1.0;
                    if i != j {
                        counts[[j, i]] += 1.0;
                    }
                }
            }
        }
    }
    if !labels.is_empty() {
        counts.mapv_inplace(|c| c / labels.len() as f64);
    }
    counts
}

/// Upper-triangle entries `(i < j)` in row-major order.
fn upper_triangle(m: &Array2<f64>) -> Vec<f64> {
    let n = m.nrows();
    let mut out = Vec::with_capacity(n * n.saturating_sub(1) / 2);
    for i in 0..n {
        for j in i + 1..n {
            out.push(m[[i, j]]);
        }
    }
    out
}

/// Cophenetic distances of an average-linkage (UPGMA) clustering of the
/// symmetric distance matrix `dist`.
pub fn upgma_cophenetic(dist: &Array2<f64>) -> Array2<f64> {
    let n = dist.nrows();
    let mut coph = Array2::<f64>::zeros((n, n));
    let mut d = dist.clone();
    let mut members: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();
    let mut active: Vec<bool> = vec![true; n];

    for _ in 1..n {
        // Closest active pair; first in row-major order on ties.
        let mut best: Option<(usize, usize, f64)> = None;
        for i in 0..n {
            if !active[i] {
                continue;
            }
            for j in i + 1..n {
                if active[j] && best.map_or(true, |(_, _, bd)| d[[i, j]] < bd) {
                    best = Some((i, j, d[[i, j]]));
                }
            }
        }
        let Some((a, b, height)) = best else { break };

        for &p in &members[a] {
            for &q in &members[b] {
                coph[[p, q]] = height;
                coph[[q, p]] = height;
            }
        }

        // Lance–Williams update for average linkage; cluster b folds into a.
        let (na, nb) = (members[a].len() as f64, members[b].len() as f64);
        for k in 0..n {
            if active[k] && k != a && k != b {
                let merged = (na * d[[a, k]] + nb * d[[b, k]]) / (na + nb);
                d[[a, k]] = merged;
                d[[k, a]] = merged;
            }
        }
        let moved = std::mem::take(&mut members[b]);
        members[a].extend(moved);
        active[b] = false;
    }
    coph
}

/// Pearson correlation; `None` when either input has zero variance.
fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    let n = x.len() as f64;
    let mx = x.iter().sum::<f64>() / n;
    let my = y.iter().sum::<f64>() / n;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (a, b) in x.iter().zip(y) {
        sxy += (a - mx) * (b - my);
        sxx += (a - mx) * (a - mx);
        syy += (b - my) * (b - my);
    }
    if sxx <= 1e-300 || syy <= 1e-300 {
        return None;
    }
    Some(sxy / (sxx.sqrt() * syy.sqrt()))
}

/// Cophenetic correlation coefficient of a consensus matrix.
///
/// Returns `1.0` when the distances carry no structure to disagree with
/// (fewer than two channel pairs, or all pairs equally distant).
pub fn cophenetic_correlation(consensus: &Array2<f64>) -> f64 {
    let dist = consensus.mapv(|c| 1.0 - c);
    let d = upper_triangle(&dist);
    if d.len() < 2 {
        return 1.0;
    }
    let c = upper_triangle(&upgma_cophenetic(&dist));
    pearson(&d, &c).unwrap_or(1.0)
}

/// Offset added to both CDFs in [`delta_y`] so empty bins never hit `log(0)`.
pub const CDF_OFFSET: f64 = 1e-10;

/// Empirical CDF of the off-diagonal consensus entries, one value per
/// [`CDF_BINS`] equal bin over `[0, 1]`.  All zeros when there are fewer
/// than two channels.
pub fn consensus_cdf(consensus: &Array2<f64>) -> Vec<f64> {
    let values = upper_triangle(consensus);
    if values.is_empty() {
        return vec![0.0; CDF_BINS];
    }
    let mut counts = [0usize; CDF_BINS];
    for v in &values {
        let bin = ((v.clamp(0.0, 1.0) * CDF_BINS as f64).floor() as usize).min(CDF_BINS - 1);
        counts[bin] += 1;
    }
    let total = values.len() as f64;
    let mut cum = 0usize;
    counts
        .iter()
        .map(|&c| {
            cum += c;
            cum as f64 / total
        })
        .collect()
}

/// Area under a consensus CDF.  The last bin always has CDF = 1 and is
/// left out of the sum.
pub fn area_under(cdf: &[f64]) -> f64 {
    let bin_width = 1.0 / CDF_BINS as f64;
    cdf.iter().take(cdf.len().saturating_sub(1)).sum::<f64>() * bin_width
}

/// Area under the empirical CDF of the off-diagonal consensus entries.
pub fn cdf_area(consensus: &Array2<f64>) -> f64 {
    area_under(&consensus_cdf(consensus))
}

/// Relative increase of the CDF area between successive ranks.
/// The first entry is the first area itself.
pub fn delta_k(areas: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(areas.len());
    for (i, &a) in areas.iter().enumerate() {
        if i == 0 {
            out.push(a);
        } else if areas[i - 1] > 0.0 {
            out.push((a - areas[i - 1]) / areas[i - 1]);
        } else {
            out.push(a);
        }
    }
    out
}

/// KL divergence `Σ p·ln(p/q)` of each rank's consensus CDF from the
/// previous rank's, both shifted by [`CDF_OFFSET`].  The first entry is 0.
pub fn delta_y(cdfs: &[Vec<f64>]) -> Vec<f64> {
    let mut out = Vec::with_capacity(cdfs.len());
    for (i, cdf) in cdfs.iter().enumerate() {
        if i == 0 {
            out.push(0.0);
            continue;
        }
        let kl = cdf
            .iter()
            .zip(&cdfs[i - 1])
            .map(|(&p, &q)| {
                let (p, q) = (p + CDF_OFFSET, q + CDF_OFFSET);
                p * (p / q).ln()
            })
            .sum();
        out.push(kl);
    }
    out
}
