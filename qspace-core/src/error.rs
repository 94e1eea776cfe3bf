//! Error types for qspace-core.

use thiserror::Error;

/// Result type alias for qspace operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for qspace operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Binner constructed with an empty or inverted range.
    #[error("invalid binner: min={min}, max={max}, bins={bins}")]
    InvalidBinner { min: f64, max: f64, bins: usize },

    /// Histogram edge directions do not span 3D space.
    #[error("degenerate histogram axes: edge directions are coplanar")]
    DegenerateAxes,

    /// A point or index fell outside the histogram.
    #[error("{what} out of range: {value}")]
    OutOfRange { what: &'static str, value: String },

    /// Matrix cannot be inverted.
    #[error("matrix is singular (determinant {0:e})")]
    SingularMatrix(f64),

    /// Column lengths of a batch disagree.
    #[error("batch columns have mismatched lengths: {0}")]
    MismatchedColumns(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    ConfigError(String),
}
