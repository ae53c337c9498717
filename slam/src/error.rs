use thiserror::Error;

/// Errors produced by the estimator core.
#[derive(Debug, Error)]
pub enum SlamError {
    /// The operation needs a seeded pose, which only the first odometry
    /// message can provide.
    #[error("estimator has no initial pose yet")]
    Uninitialized,

    /// A linear-algebra shape disagreement. Always a programming error and
    /// fatal to the current batch, never to the estimator.
    #[error("dimension mismatch in {context}: expected {expected:?}, got {actual:?}")]
    Dimension {
        context: &'static str,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    /// A singular matrix inversion or a non-finite intermediate result.
    #[error("numeric failure: {0}")]
    Numeric(&'static str),

    /// An observation that is geometrically unusable in the current state.
    #[error("degenerate observation: {0}")]
    Degenerate(&'static str),
}

pub type Result<T> = std::result::Result<T, SlamError>;
