//! qspace-io: event sources and peak files.
//!
//! - [`EventFileReader`] - memory-mapped flat `(tof, pixel id)` event files
//! - [`FileEventLoader`] - segmented, multi-threaded loading with a memory
//!   budget
//! - [`SocketEventListener`] - live UDP event feed with a flushing buffer
//! - [`PeaksFile`] - ISAW-style peaks file reader and writer
//!

pub mod buffer;
mod error;
pub mod listener;
pub mod loader;
pub mod peaks_file;
mod reader;
mod writer;

pub use buffer::EventBuffer;
pub use error::{Error, Result};
pub use listener::{
    ListenerConfig, ListenerEvent, ListenerState, ListenerStats, PacketProcessor,
    SocketEventListener,
};
pub use loader::{FileEventLoader, LoadRequest, LoadSummary, LoadedSegment, LoaderConfig};
pub use peaks_file::{PeaksFile, PeaksFileWriter};
pub use reader::{EventFileReader, MappedFileReader, EVENT_RECORD_LEN};
pub use writer::EventFileWriter;
