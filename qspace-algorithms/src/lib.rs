//! qspace-algorithms: the processing stages between raw events and
//! integrated peaks.
//!
//! # Stages
//!
//! - [`EventMapper`] - parallel `(tof, pixel id)` to Q mapping with
//!   per-sub-range failure reporting
//! - [`find_histogram_peaks`] - sorted local-maximum search over histogram
//!   pages
//! - [`PeakEventList`] - per-peak event partitioning and recentring
//! - [`integrate_peaks_events`] / [`integrate_peaks_histogram`] - sphere
//!   integration, plus slice and cylinder variants
//! - [`QuickIntegrator`] - lattice-aligned integration of every hkl
//! - [`DqProfile`] - |Q| and d-spacing profiles
//!

pub mod error;
pub mod integration;
pub mod mapper;
pub mod partition;
pub mod peak_finder;
pub mod profile;
pub mod quick_integrate;

pub use error::{Error, Result};
pub use integration::{
    cylinder_integrate_5, integrate_peaks_events, integrate_peaks_histogram, integrate_slice,
    integrate_slices, SliceIntegral, SphereConfig,
};
pub use mapper::{split_ranges, EventMapper, MappedRange, MapperConfig, TaskGroupOutcome};
pub use partition::{
    split_events_by_hkl, split_events_by_id, EventInfo, PeakCenter, PeakEventList, WindowShape,
};
pub use peak_finder::{find_histogram_peaks, find_peaks, PeakCandidate, PeakFinderConfig};
pub use profile::{DqProfile, ProfileKind};
pub use quick_integrate::{QuickIntegrateConfig, QuickIntegrateResults, QuickIntegrator, QuickPeak};
