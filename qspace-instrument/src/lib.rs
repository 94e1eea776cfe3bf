//! qspace-instrument: instrument geometry and the live event packet codec.
//!
//! # Key Components
//!
//! - [`InstrumentCalibration`] - L1, T0 shift and detector grids, loaded
//!   from JSON and validated once
//! - [`TofToQMap`] - per-pixel tables turning `(tof, pixel id)` into a Q
//!   vector and weight
//! - [`PacketCodec`] - classification and decoding of UDP command and
//!   data packets

mod calibration;
pub mod error;
mod grid;
mod instrument;
pub mod packet;
pub mod q_map;

pub use calibration::{InstrumentCalibration, PixelLocation};
pub use error::{Error, Result};
pub use grid::DetectorGrid;
pub use instrument::Instrument;
pub use packet::{ByteOrder, DataPacket, Packet, PacketCodec};
pub use q_map::{IncidentSpectrum, MappedBatch, TofToQMap, ANGST_PER_US_PER_M};
