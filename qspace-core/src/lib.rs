//! qspace-core: Core types for reciprocal-space event processing.
//!
//! This crate provides the data model shared by the rest of the workspace:
//! column-wise raw and Q event batches, the [`Histogram3D`] binning
//! structure, the [`Peak`] type, the validated [`OrientationMatrix`] and the
//! background-subtraction statistics every integration mode relies on.
//!

pub mod binner;
pub mod error;
pub mod event;
pub mod geometry;
pub mod histogram;
pub mod integrate;
pub mod orientation;
pub mod peak;

pub use binner::{ProjectionBinner, UniformBinner};
pub use error::{Error, Result};
pub use event::{QEventBatch, RawEvent, RawEventBatch};
pub use geometry::{Mat3, Vec3};
pub use histogram::{Histogram3D, SphereIntegrals};
pub use integrate::{get_i_and_sig_i, BACKGROUND_RATIO};
pub use orientation::OrientationMatrix;
pub use peak::{IntensityEstimate, MillerIndex, Peak, RunInfo};
