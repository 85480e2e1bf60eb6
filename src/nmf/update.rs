//! Update strategies and objective functions.
//!
//! A run owns one [`UpdateRule`] for its whole lifetime; rules with internal
//! state (the adaptive step of the sparse rule) keep it there.  The
//! unconstrained Lee–Seung updates live here, the sparseness-constrained
//! rule in [`super::sparse`].
use ndarray::{Array2, Zip};

use crate::config::{NmfConfig, Objective};

use super::sparse::SparseProjected;

/// Guard added to every denominator of the multiplicative updates.
pub const EPS: f64 = 1e-10;

/// Result of one sweep over both factors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    /// Objective after the sweep.
    pub objective: f64,
    /// The rule cannot make further progress (e.g. the projected-gradient
    /// step size collapsed).  Counts as converged.
    pub stalled: bool,
}

/// One optimisation strategy for `V ≈ W·H` with `W, H ≥ 0`.
pub trait UpdateRule: Send {
    /// Bring freshly initialised factors into the rule's feasible set.
    fn prepare(&mut self, _v: &Array2<f64>, _w: &mut Array2<f64>, _h: &mut Array2<f64>) {}

    /// Update `h` then `w` once.
    fn step(&mut self, v: &Array2<f64>, w: &mut Array2<f64>, h: &mut Array2<f64>) -> StepOutcome;

    /// Objective minimised by this rule.
    fn objective(&self, v: &Array2<f64>, w: &Array2<f64>, h: &Array2<f64>) -> f64;
}

/// Build the rule a run should use from its configuration.
pub fn build_rule(cfg: &NmfConfig) -> Box<dyn UpdateRule> {
    match cfg.sparseness {
        Some(target) => Box::new(SparseProjected::new(target, cfg.sparse_factor)),
        None => Box::new(Multiplicative { objective: cfg.objective }),
    }
}

// ── Objectives ───────────────────────────────────────────────────────────────

/// `‖V − WH‖²_F`.
pub fn euclidean(v: &Array2<f64>, w: &Array2<f64>, h: &Array2<f64>) -> f64 {
    let wh = w.dot(h);
    Zip::from(v).and(&wh).fold(0.0, |acc, &a, &b| acc + (a - b) * (a - b))
}

/// Generalised KL divergence `Σ V·ln(V / WH) − V + WH`, with `0·ln 0 = 0`.
pub fn kl_divergence(v: &Array2<f64>, w: &Array2<f64>, h: &Array2<f64>) -> f64 {
    let wh = w.dot(h);
    Zip::from(v).and(&wh).fold(0.0, |acc, &a, &b| {
        let log_term = if a > 0.0 { a * (a / (b + EPS)).ln() } else { 0.0 };
        acc + log_term - a + b
    })
}

/// `‖V − WH‖_F / ‖V‖_F`; zero for an all-zero `V` reconstructed exactly.
pub fn relative_residual(v: &Array2<f64>, w: &Array2<f64>, h: &Array2<f64>) -> f64 {
    let norm_v = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    let resid = euclidean(v, w, h).sqrt();
    if norm_v > 0.0 {
        resid / norm_v
    } else {
        resid
    }
}

// ── Lee–Seung multiplicative updates ─────────────────────────────────────────

/// Multiplicative updates for the Euclidean or KL objective.
#[derive(Debug, Clone, Copy)]
pub struct Multiplicative {
    pub objective: Objective,
}

impl Multiplicative {
    fn step_euclidean(v: &Array2<f64>, w: &mut Array2<f64>, h: &mut Array2<f64>) {
        // H ← H ∘ (WᵀV) ⊘ (WᵀW·H)
        let wt = w.t();
        let num = wt.dot(v);
        let den = wt.dot(&*w).dot(&*h);
        Zip::from(&mut *h).and(&num).and(&den).for_each(|x, &n, &d| *x *= n / (d + EPS));

        // W ← W ∘ (VHᵀ) ⊘ (W·HHᵀ)
        let ht = h.t();
        let num = v.dot(&ht);
        let den = w.dot(&h.dot(&ht));
        Zip::from(&mut *w).and(&num).and(&den).for_each(|x, &n, &d| *x *= n / (d + EPS));
    }

    fn step_kl(v: &Array2<f64>, w: &mut Array2<f64>, h: &mut Array2<f64>) {
        // H[a, j] ← H[a, j] · Σ_i W[i, a]·V[i, j]/(WH)[i, j] / Σ_i W[i, a]
        let ratio = kl_ratio(v, &w.dot(&*h));
        let num = w.t().dot(&ratio);
        let col_sums = w.sum_axis(ndarray::Axis(0));
        Zip::indexed(&mut *h).and(&num).for_each(|(a, _), x, &n| *x *= n / (col_sums[a] + EPS));

        // W[i, a] ← W[i, a] · Σ_j H[a, j]·V[i, j]/(WH)[i, j] / Σ_j H[a, j]
        let ratio = kl_ratio(v, &w.dot(&*h));
        let num = ratio.dot(&h.t());
        let row_sums = h.sum_axis(ndarray::Axis(1));
        Zip::indexed(&mut *w).and(&num).for_each(|(_, a), x, &n| *x *= n / (row_sums[a] + EPS));
    }
}

fn kl_ratio(v: &Array2<f64>, wh: &Array2<f64>) -> Array2<f64> {
    Zip::from(v).and(wh).map_collect(|&a, &b| a / (b + EPS))
}

impl UpdateRule for Multiplicative {
    fn step(&mut self, v: &Array2<f64>, w: &mut Array2<f64>, h: &mut Array2<f64>) -> StepOutcome {
        match self.objective {
            Objective::Euclidean => Self::step_euclidean(v, w, h),
            Objective::KullbackLeibler => Self::step_kl(v, w, h),
        }
        StepOutcome { objective: self.objective(v, w, h), stalled: false }
    }

    fn objective(&self, v: &Array2<f64>, w: &Array2<f64>, h: &Array2<f64>) -> f64 {
        match self.objective {
            Objective::Euclidean => euclidean(v, w, h),
            Objective::KullbackLeibler => kl_divergence(v, w, h),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn problem() -> (Array2<f64>, Array2<f64>, Array2<f64>) {
        let w_true = array![[1.0, 0.2], [0.5, 1.0], [0.1, 0.7]];
        let h_true = array![[1.0, 0.0, 2.0, 0.5], [0.3, 1.5, 0.0, 1.0]];
        let v = w_true.dot(&h_true);
        let w0 = array![[0.6, 0.4], [0.3, 0.8], [0.5, 0.5]];
        let h0 = array![[0.4, 0.6, 0.5, 0.3], [0.7, 0.2, 0.4, 0.6]];
        (v, w0, h0)
    }

    #[test]
    fn euclidean_objective_never_increases() {
        let (v, mut w, mut h) = problem();
        let mut rule = Multiplicative { objective: Objective::Euclidean };
        let mut prev = rule.objective(&v, &w, &h);
        for _ in 0..1000 {
            let out = rule.step(&v, &mut w, &mut h);
            assert!(out.objective <= prev * (1.0 + 1e-9) + 1e-12, "{} > {prev}", out.objective);
            prev = out.objective;
        }
        assert!(w.iter().chain(h.iter()).all(|&x| x >= 0.0));
        assert!(relative_residual(&v, &w, &h) < 0.05);
    }

    #[test]
    fn kl_objective_never_increases() {
        let (v, mut w, mut h) = problem();
        let mut rule = Multiplicative { objective: Objective::KullbackLeibler };
        let mut prev = rule.objective(&v, &w, &h);
        for _ in 0..200 {
            let out = rule.step(&v, &mut w, &mut h);
            assert!(out.objective <= prev + 1e-9, "{} > {prev}", out.objective);
            prev = out.objective;
        }
        assert!(w.iter().chain(h.iter()).all(|&x| x >= 0.0));
    }

    #[test]
    fn exact_factors_have_zero_objectives() {
        let w = array![[1.0], [2.0]];
        let h = array![[3.0, 0.0, 1.0]];
        let v = w.dot(&h);
        approx::assert_abs_diff_eq!(euclidean(&v, &w, &h), 0.0);
        approx::assert_abs_diff_eq!(kl_divergence(&v, &w, &h), 0.0, epsilon = 1e-8);
        approx::assert_abs_diff_eq!(relative_residual(&v, &w, &h), 0.0);
    }
}
