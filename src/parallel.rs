//! Conditional parallel iteration.
//!
//! With the `parallel` feature (on by default) the NMF runs are scheduled on
//! the rayon thread pool; without it the same code runs sequentially and
//! produces identical results, since every run owns its own random stream.
//!
//! ```ignore
//! use crate::iter_maybe_parallel;
//!
//! let objectives: Vec<f64> = iter_maybe_parallel!(0..n_runs)
//!     .map(|run| engine.factorize(v, rank, run).objective)
//!     .collect();
//! ```

/// Iterate over an `IntoIterator` in parallel when the `parallel` feature
/// is enabled, sequentially otherwise.
///
/// Only combinators shared by `Iterator` and rayon's `ParallelIterator`
/// (`map`, `filter`, `collect`, ...) may follow the macro.
#[macro_export]
macro_rules! iter_maybe_parallel {
    ($expr:expr) => {{
        #[cfg(feature = "parallel")]
        {
            use rayon::iter::IntoParallelIterator;

            IntoParallelIterator::into_par_iter($expr)
        }
        #[cfg(not(feature = "parallel"))]
        {
            IntoIterator::into_iter($expr)
        }
    }};
}

/// Number of worker threads runs are spread over.
pub fn worker_count() -> usize {
    #[cfg(feature = "parallel")]
    {
        rayon::current_num_threads()
    }
    #[cfg(not(feature = "parallel"))]
    {
        1
    }
}
