//! Error types for the detection engine.
//!
//! Only structural problems are errors. An NMF run that stops at the
//! iteration cap is a [`crate::nmf::ConvergenceWarning`], recorded next to
//! the run and logged, never returned through this enum.
use thiserror::Error;

/// Errors raised by the line-length, NMF, consolidation and thresholding stages.
#[derive(Error, Debug)]
pub enum SpidetError {
    /// Malformed or inconsistent traces, matrices or parameters.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Rank range is malformed relative to the energy matrix.
    #[error(
        "invalid rank range ({k_min}, {k_max}): ranks must satisfy 1 <= k_min <= k_max <= {limit}"
    )]
    InvalidRank {
        k_min: usize,
        k_max: usize,
        limit: usize,
    },

    /// Thresholding was asked to work on a zero-length signal.
    #[error("activation signal is empty")]
    EmptySignal,

    /// Every candidate rank was reported unusable.
    #[error("no usable rank: every rank in {k_min}..={k_max} failed to converge in all runs")]
    NoUsableRank { k_min: usize, k_max: usize },

    /// The decomposition was cancelled before it completed.
    #[error("decomposition cancelled")]
    Cancelled,

    /// A pipeline stage failed; `context` names the parameters involved.
    #[error("{stage} stage failed ({context}): {source}")]
    Stage {
        stage: &'static str,
        context: String,
        #[source]
        source: Box<SpidetError>,
    },
}

impl SpidetError {
    /// Wrap `self` with the name of the pipeline stage that produced it.
    pub fn in_stage(self, stage: &'static str, context: impl Into<String>) -> Self {
        SpidetError::Stage {
            stage,
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through any [`SpidetError::Stage`] wrappers.
    pub fn root(&self) -> &SpidetError {
        match self {
            SpidetError::Stage { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result type alias for detection operations.
pub type Result<T> = std::result::Result<T, SpidetError>;

/// Shorthand for `Err(SpidetError::InvalidInput(..))` with `format!` arguments.
macro_rules! invalid {
    ($($arg:tt)*) => {
        return Err($crate::error::SpidetError::InvalidInput(format!($($arg)*)))
    };
}
pub(crate) use invalid;
