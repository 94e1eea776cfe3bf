//! Pipeline error types.

use thiserror::Error;

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while handling messages.
#[derive(Error, Debug)]
pub enum Error {
    /// A message needs an instrument but none has been set.
    #[error("no instrument has been set")]
    NoInstrument,

    /// A message needs an orientation matrix but none has been set.
    #[error("no orientation matrix has been set")]
    NoOrientation,

    /// Invalid pipeline configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Core library error.
    #[error("core error: {0}")]
    CoreError(#[from] qspace_core::Error),

    /// Instrument error.
    #[error("instrument error: {0}")]
    InstrumentError(#[from] qspace_instrument::Error),

    /// Algorithm error.
    #[error("algorithm error: {0}")]
    AlgorithmError(#[from] qspace_algorithms::Error),

    /// File or socket error.
    #[error("I/O error: {0}")]
    IoError(#[from] qspace_io::Error),
}
