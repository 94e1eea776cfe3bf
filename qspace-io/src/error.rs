//! I/O error types.

use thiserror::Error;

/// Result type for I/O operations.
pub type Result<T> = std::result::Result<T, Error>;

/// I/O error types.
#[derive(Error, Debug)]
pub enum Error {
    /// File or socket I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid file format.
    #[error("invalid file format: {0}")]
    InvalidFormat(String),

    /// Invalid loader or listener configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A file segment could not be loaded; the load was aborted.
    #[error("segment {segment} failed: {reason}")]
    SegmentLoad { segment: usize, reason: String },

    /// A wave of segment workers did not finish in time.
    #[error("segment wave timed out after {0:?}")]
    WaveTimeout(std::time::Duration),

    /// Malformed peak file line.
    #[error("peak file line {line}: {reason}")]
    PeakFile { line: usize, reason: String },

    /// Core library error.
    #[error("core error: {0}")]
    CoreError(#[from] qspace_core::Error),

    /// Instrument error.
    #[error("instrument error: {0}")]
    InstrumentError(#[from] qspace_instrument::Error),
}
