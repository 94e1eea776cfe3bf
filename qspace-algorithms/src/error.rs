//! Algorithm error types.

use thiserror::Error;

/// Result type for algorithm operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by mapping, partitioning and integration.
#[derive(Error, Debug)]
pub enum Error {
    /// An event in a strictly mapped sub-range had an unknown pixel id.
    #[error("invalid pixel id {pixel_id} at event {index}")]
    InvalidPixel { index: usize, pixel_id: u32 },

    /// No event of the hkl list lies within tolerance of the peak.
    #[error("no events within {tolerance} of hkl {hkl}")]
    NoEventsInTolerance { hkl: String, tolerance: f64 },

    /// A peak needs Miller indices but has none.
    #[error("peak {0} is not indexed")]
    NotIndexed(u32),

    /// Invalid algorithm parameters.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Core library error.
    #[error("core error: {0}")]
    CoreError(#[from] qspace_core::Error),

    /// Instrument error.
    #[error("instrument error: {0}")]
    InstrumentError(#[from] qspace_instrument::Error),
}
