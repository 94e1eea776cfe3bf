//! qspace-pipeline: typed message routing for live and file-driven
//! reduction.
//!
//! A [`Pipeline`] owns one FIFO queue of [`Message`]s and a [`Router`]
//! that hands each message to the handlers subscribed to its
//! [`MessageKind`]. The standard handlers are:
//!
//! - [`FileLoadHandler`] - event files to `MapEventsToQ`
//! - [`MapperHandler`] - raw events to Q
//! - [`HistogramHandler`] - the live histogram, instrument changes, peak
//!   search and sphere integration
//! - [`QuickIntegrateHandler`] - orientation matrix and lattice integration
//! - [`DqHandler`] - |Q| and d profiles
//! - [`PeakFileHandler`] - peak file output
//!
//! Shared objects (instrument, histogram, orientation) are replaced as a
//! whole; see [`Shared`].

mod error;
pub mod handlers;
pub mod message;
pub mod pipeline;
pub mod router;
pub mod shared;

pub use error::{Error, Result};
pub use handlers::{
    DqHandler, FileLoadHandler, HistogramHandler, MapperHandler, PeakFileHandler,
    QuickIntegrateHandler,
};
pub use message::{CalibrationSource, Message, MessageKind, Profile};
pub use pipeline::{Pipeline, PipelineConfig, DEFAULT_MAX_Q, DEFAULT_NUM_BINS};
pub use router::{Handler, Router};
pub use shared::{InstrumentContext, PipelineState, Shared};
