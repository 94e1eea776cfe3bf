//! Instrument-specific error types.

use thiserror::Error;

/// Result type for instrument operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Instrument-specific error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Packet shorter than its type requires.
    #[error("packet too short: {len} bytes, need at least {min}")]
    PacketTooShort { len: usize, min: usize },

    /// Instrument name not supported.
    #[error("unsupported instrument: {0}")]
    UnknownInstrument(String),

    /// Calibration is structurally invalid.
    #[error("invalid calibration: {0}")]
    InvalidCalibration(String),

    /// Malformed JSON configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Core library error.
    #[error("core error: {0}")]
    CoreError(#[from] qspace_core::Error),
}
