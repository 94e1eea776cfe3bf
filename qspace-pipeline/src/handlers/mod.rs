//! Pipeline stages.
//!
//! Each handler owns its private state and reaches shared state only
//! through [`crate::PipelineState`].

mod dq;
mod file_load;
mod histogram;
mod mapper;
mod peak_file;
mod quick_integrate;

pub use dq::DqHandler;
pub use file_load::FileLoadHandler;
pub use histogram::HistogramHandler;
pub use mapper::MapperHandler;
pub use peak_file::PeakFileHandler;
pub use quick_integrate::QuickIntegrateHandler;
