//! Sparseness-constrained NMF (Hoyer, "Non-negative Matrix Factorization
//! with Sparseness Constraints", JMLR 2004).
//!
//! Sparseness of a vector `x ∈ ℝⁿ` is
//!
//! ```text
//! σ(x) = (√n − ‖x‖₁ / ‖x‖₂) / (√n − 1)
//! ```
//!
//! which is 0 for a constant vector and 1 for a single non-zero entry.  The
//! constrained factor is updated by projected gradient descent with an
//! adaptive step: after each gradient step every component is projected
//! onto the non-negative vectors with its current L2 norm and the L1 norm
//! that realises the target sparseness.  The other factor gets the plain
//! multiplicative update and its rows are kept at unit energy.
use ndarray::{Array2, ArrayView2, ArrayViewMut2, Zip};

use crate::config::SparseFactor;

use super::update::{StepOutcome, UpdateRule, EPS};

/// Smallest step size before the rule declares itself stalled.
const MIN_STEP: f64 = 1e-200;

/// Hoyer's sparseness measure; `0.0` for vectors of length ≤ 1 or all zeros.
pub fn sparseness(x: &[f64]) -> f64 {
    let n = x.len();
    if n <= 1 {
        return 0.0;
    }
    let l1: f64 = x.iter().map(|v| v.abs()).sum();
    let l2: f64 = x.iter().map(|v| v * v).sum::<f64>().sqrt();
    if l2 == 0.0 {
        return 0.0;
    }
    let sqrt_n = (n as f64).sqrt();
    (sqrt_n - l1 / l2) / (sqrt_n - 1.0)
}

/// L1/L2 ratio a vector of length `n` must have to reach sparseness `target`.
pub fn l1_ratio(n: usize, target: f64) -> f64 {
    let sqrt_n = (n as f64).sqrt();
    sqrt_n - (sqrt_n - 1.0) * target
}

/// Closest non-negative vector to `s` with `Σv = l1` and `Σv² = l2_sq`.
///
/// Alternates between projecting onto the L1 hyperplane and the L2 sphere,
/// clamping negative coordinates to zero and removing them from the active
/// set until the solution is non-negative.
pub fn project_sparse(s: &[f64], l1: f64, l2_sq: f64) -> Vec<f64> {
    let n = s.len();
    if n == 0 {
        return vec![];
    }
    let shift = (l1 - s.iter().sum::<f64>()) / n as f64;
    let mut v: Vec<f64> = s.iter().map(|x| x + shift).collect();
    let mut zeroed = vec![false; n];

    for _ in 0..=n {
        let n_active = zeroed.iter().filter(|z| !**z).count();
        if n_active == 0 {
            break;
        }
        let mid = l1 / n_active as f64;
        let dir: Vec<f64> = v
            .iter()
            .zip(&zeroed)
            .map(|(&x, &z)| if z { 0.0 } else { x - mid })
            .collect();

        // Largest α with ‖mid + α·dir‖² = l2_sq, written around v.
        let a: f64 = dir.iter().map(|d| d * d).sum();
        let b: f64 = 2.0 * dir.iter().zip(&v).map(|(d, x)| d * x).sum::<f64>();
        let c: f64 = v.iter().map(|x| x * x).sum::<f64>() - l2_sq;
        let alpha = if a > f64::MIN_POSITIVE {
            (-b + (b * b - 4.0 * a * c).max(0.0).sqrt()) / (2.0 * a)
        } else {
            0.0
        };
        for (x, d) in v.iter_mut().zip(&dir) {
            *x += alpha * d;
        }

        if v.iter().all(|&x| x >= 0.0) {
            return v;
        }

        for (x, z) in v.iter_mut().zip(zeroed.iter_mut()) {
            if *x <= 0.0 {
                *z = true;
                *x = 0.0;
            }
        }
        let n_active = zeroed.iter().filter(|z| !**z).count();
        if n_active == 0 {
            break;
        }
        let fix = (l1 - v.iter().sum::<f64>()) / n_active as f64;
        for (x, z) in v.iter_mut().zip(&zeroed) {
            if !*z {
                *x += fix;
            }
        }
    }
    v.iter_mut().for_each(|x| *x = x.max(0.0));
    v
}

/// Project every column of `c` to L1/L2 ratio `l1a`, keeping its L2 norm.
fn project_columns(c: &mut ArrayViewMut2<f64>, l1a: f64) {
    for mut col in c.columns_mut() {
        let norm = col.dot(&col).sqrt();
        if norm == 0.0 {
            continue;
        }
        let projected = project_sparse(&col.to_vec(), l1a * norm, norm * norm);
        col.assign(&ndarray::ArrayView1::from(&projected));
    }
}

fn half_sq_residual(v: ArrayView2<f64>, c: ArrayView2<f64>, f: ArrayView2<f64>) -> f64 {
    let cf = c.dot(&f);
    0.5 * Zip::from(&v).and(&cf).fold(0.0, |acc, &a, &b| acc + (a - b) * (a - b))
}

/// Hoyer's NMFsc with the constraint on one factor.
#[derive(Debug, Clone)]
pub struct SparseProjected {
    target: f64,
    factor: SparseFactor,
    step: f64,
}

impl SparseProjected {
    pub fn new(target: f64, factor: SparseFactor) -> Self {
        Self { target, factor, step: 1.0 }
    }

    /// Current projected-gradient step size.
    pub fn step_size(&self) -> f64 {
        self.step
    }

    /// One sweep on `V ≈ C·F` where the columns of `c` are constrained.
    fn sweep(
        &mut self,
        v: ArrayView2<f64>,
        mut c: ArrayViewMut2<f64>,
        mut f: ArrayViewMut2<f64>,
    ) -> StepOutcome {
        let l1a = l1_ratio(c.nrows(), self.target);

        // Free factor: multiplicative update, rows renormalised to unit energy.
        let ct = c.t();
        let num = ct.dot(&v);
        let den = ct.dot(&c).dot(&f);
        Zip::from(&mut f).and(&num).and(&den).for_each(|x, &n, &d| *x *= n / (d + EPS));
        for (a, mut row) in f.rows_mut().into_iter().enumerate() {
            let norm = row.dot(&row).sqrt();
            if norm > 0.0 {
                row /= norm;
                let mut col = c.column_mut(a);
                col *= norm;
            }
        }

        // Constrained factor: projected gradient with backtracking.
        let begin = half_sq_residual(v, c.view(), f.view());
        let grad = (c.dot(&f) - &v).dot(&f.t());
        loop {
            let mut candidate: Array2<f64> = &c - &(&grad * self.step);
            project_columns(&mut candidate.view_mut(), l1a);
            let obj = half_sq_residual(v, candidate.view(), f.view());
            if obj <= begin {
                c.assign(&candidate);
                self.step *= 1.2;
                return StepOutcome { objective: obj, stalled: false };
            }
            self.step /= 2.0;
            if self.step < MIN_STEP {
                return StepOutcome { objective: begin, stalled: true };
            }
        }
    }
}

impl UpdateRule for SparseProjected {
    fn prepare(&mut self, _v: &Array2<f64>, w: &mut Array2<f64>, h: &mut Array2<f64>) {
        match self.factor {
            SparseFactor::Basis => {
                let l1a = l1_ratio(w.nrows(), self.target);
                project_columns(&mut w.view_mut(), l1a);
            }
            SparseFactor::Activation => {
                let l1a = l1_ratio(h.ncols(), self.target);
                project_columns(&mut h.view_mut().reversed_axes(), l1a);
            }
        }
    }

    fn step(&mut self, v: &Array2<f64>, w: &mut Array2<f64>, h: &mut Array2<f64>) -> StepOutcome {
        match self.factor {
            SparseFactor::Basis => self.sweep(v.view(), w.view_mut(), h.view_mut()),
            // Vᵀ ≈ Hᵀ·Wᵀ: the columns of Hᵀ are the rows of H.
            SparseFactor::Activation => {
                self.sweep(v.t(), h.view_mut().reversed_axes(), w.view_mut().reversed_axes())
            }
        }
    }

    fn objective(&self, v: &Array2<f64>, w: &Array2<f64>, h: &Array2<f64>) -> f64 {
        half_sq_residual(v.view(), w.view(), h.view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn sparseness_extremes() {
        approx::assert_abs_diff_eq!(sparseness(&[1.0; 9]), 0.0, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(sparseness(&[0.0, 0.0, 3.0, 0.0]), 1.0, epsilon = 1e-12);
        assert_eq!(sparseness(&[0.0; 5]), 0.0);
    }

    #[test]
    fn projection_reaches_target_sparseness() {
        let s: Vec<f64> =
            (0..20).map(|i| ((i * 7 % 11) as f64 * 0.37).sin().abs() + 0.05).collect();
        let l2 = s.iter().map(|x| x * x).sum::<f64>().sqrt();
        for target in [0.2, 0.5, 0.8] {
            let p = project_sparse(&s, l1_ratio(s.len(), target) * l2, l2 * l2);
            assert!(p.iter().all(|&x| x >= 0.0));
            let p_l2 = p.iter().map(|x| x * x).sum::<f64>().sqrt();
            approx::assert_abs_diff_eq!(p_l2, l2, epsilon = 1e-8);
            approx::assert_abs_diff_eq!(sparseness(&p), target, epsilon = 1e-6);
        }
    }

    #[test]
    fn sparse_basis_columns_hit_target() {
        let v = array![
            [1.0, 0.1, 0.9, 0.2, 0.8],
            [0.9, 0.2, 1.0, 0.1, 0.7],
            [0.1, 1.0, 0.2, 0.9, 0.1],
            [0.2, 0.8, 0.1, 1.0, 0.2],
        ];
        let mut w = array![[0.5, 0.4], [0.6, 0.3], [0.2, 0.7], [0.3, 0.5]];
        let mut h = Array2::from_elem((2, 5), 0.5);
        let mut rule = SparseProjected::new(0.6, SparseFactor::Basis);
        rule.prepare(&v, &mut w, &mut h);
        let start = rule.objective(&v, &w, &h);
        let mut last = StepOutcome { objective: start, stalled: false };
        for _ in 0..100 {
            last = rule.step(&v, &mut w, &mut h);
            if last.stalled {
                break;
            }
        }
        assert!(last.objective <= start);
        assert!(w.iter().chain(h.iter()).all(|&x| x >= 0.0));
        for col in w.columns() {
            approx::assert_abs_diff_eq!(sparseness(&col.to_vec()), 0.6, epsilon = 1e-6);
        }
    }

    #[test]
    fn sparse_activation_rows_hit_target() {
        let v = array![[1.0, 0.0, 0.5, 0.2, 0.0, 0.9], [0.5, 0.1, 0.3, 0.1, 0.0, 0.4]];
        let mut w = array![[0.7], [0.4]];
        let mut h = array![[0.3, 0.2, 0.5, 0.4, 0.1, 0.6]];
        let mut rule = SparseProjected::new(0.5, SparseFactor::Activation);
        rule.prepare(&v, &mut w, &mut h);
        for _ in 0..50 {
            if rule.step(&v, &mut w, &mut h).stalled {
                break;
            }
        }
        assert!(w.iter().chain(h.iter()).all(|&x| x >= 0.0));
        approx::assert_abs_diff_eq!(sparseness(&h.row(0).to_vec()), 0.5, epsilon = 1e-6);
    }
}
