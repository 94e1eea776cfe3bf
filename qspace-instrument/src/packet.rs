//! Live event stream packet format.
//!
//! Every UDP datagram is either a command packet or a data packet:
//!
//! * command: bytes `[4..7)` equal [`COMMAND_MARKER`]; an `f64` scale
//!   increment lives at a configurable offset (default 40, big-endian).
//! * data: a 48-byte header followed by `(tof: i32, id: i32)` little-endian
//!   records. Count fields in the header are not trusted; the record count
//!   is derived from the datagram length.

use serde::{Deserialize, Serialize};

use qspace_core::RawEventBatch;

use crate::{Error, Result};

/// Bytes before the first event record of a data packet.
pub const DATA_HEADER_LEN: usize = 48;
/// Size of one `(tof, id)` record.
pub const RECORD_LEN: usize = 8;
/// Bytes identifying a command packet.
pub const COMMAND_MARKER: [u8; 3] = [0x00, 0x02, 0x00];
/// Position of [`COMMAND_MARKER`].
pub const MARKER_OFFSET: usize = 4;
/// Default offset of the scale increment in a command packet.
pub const DEFAULT_SCALE_OFFSET: usize = 40;
/// Shortest command packet accepted regardless of the scale offset.
pub const MIN_COMMAND_LEN: usize = 44;

/// Byte order of the command-packet scale value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ByteOrder {
    #[default]
    BigEndian,
    LittleEndian,
}

/// A classified datagram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Packet<'a> {
    /// Scale increment from a command packet.
    Command { scale: f64 },
    Data(DataPacket<'a>),
}

/// Borrowed view of a data packet's records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPacket<'a> {
    records: &'a [u8],
}

impl<'a> DataPacket<'a> {
    /// Number of complete records; a trailing partial record is ignored.
    #[must_use]
    pub fn num_records(&self) -> usize {
        self.records.len() / RECORD_LEN
    }

    /// Raw `(tof, id)` pairs including negative values.
    pub fn records(&self) -> impl Iterator<Item = (i32, i32)> + 'a {
        self.records.chunks_exact(RECORD_LEN).map(|chunk| {
            let tof = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let id = i32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
            (tof, id)
        })
    }

    /// Appends records with non-negative tof and id to `batch`, returning
    /// how many were dropped.
    pub fn decode_into(&self, batch: &mut RawEventBatch) -> usize {
        let mut dropped = 0;
        for (tof, id) in self.records() {
            match (u32::try_from(tof), u32::try_from(id)) {
                (Ok(tof), Ok(id)) => batch.push(tof, id),
                _ => dropped += 1,
            }
        }
        dropped
    }
}

/// Classifies and decodes datagrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketCodec {
    pub scale_offset: usize,
    pub byte_order: ByteOrder,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self {
            scale_offset: DEFAULT_SCALE_OFFSET,
            byte_order: ByteOrder::BigEndian,
        }
    }
}

impl PacketCodec {
    #[must_use]
    pub fn with_scale_offset(mut self, offset: usize) -> Self {
        self.scale_offset = offset;
        self
    }

    #[must_use]
    pub fn with_byte_order(mut self, order: ByteOrder) -> Self {
        self.byte_order = order;
        self
    }

    /// Minimum length of a command packet under this codec.
    #[must_use]
    pub fn min_command_len(&self) -> usize {
        (self.scale_offset + 8).max(MIN_COMMAND_LEN)
    }

    /// True if the marker bytes identify a command packet.
    #[must_use]
    pub fn is_command(bytes: &[u8]) -> bool {
        bytes.get(MARKER_OFFSET..MARKER_OFFSET + COMMAND_MARKER.len()) == Some(&COMMAND_MARKER[..])
    }

    /// Classifies a datagram.
    ///
    /// # Errors
    /// Returns [`Error::PacketTooShort`] for a command packet shorter than
    /// [`Self::min_command_len`] or a data packet shorter than the header.
    pub fn classify<'a>(&self, bytes: &'a [u8]) -> Result<Packet<'a>> {
        if Self::is_command(bytes) {
            let min = self.min_command_len();
            if bytes.len() < min {
                return Err(Error::PacketTooShort {
                    len: bytes.len(),
                    min,
                });
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[self.scale_offset..self.scale_offset + 8]);
            let scale = match self.byte_order {
                ByteOrder::BigEndian => f64::from_be_bytes(raw),
                ByteOrder::LittleEndian => f64::from_le_bytes(raw),
            };
            return Ok(Packet::Command { scale });
        }
        if bytes.len() < DATA_HEADER_LEN {
            return Err(Error::PacketTooShort {
                len: bytes.len(),
                min: DATA_HEADER_LEN,
            });
        }
        Ok(Packet::Data(DataPacket {
            records: &bytes[DATA_HEADER_LEN..],
        }))
    }

    /// Builds a command packet carrying `scale`.
    #[must_use]
    pub fn encode_command(&self, scale: f64) -> Vec<u8> {
        let mut bytes = vec![0u8; self.min_command_len()];
        bytes[MARKER_OFFSET..MARKER_OFFSET + COMMAND_MARKER.len()].copy_from_slice(&COMMAND_MARKER);
        let raw = match self.byte_order {
            ByteOrder::BigEndian => scale.to_be_bytes(),
            ByteOrder::LittleEndian => scale.to_le_bytes(),
        };
        bytes[self.scale_offset..self.scale_offset + 8].copy_from_slice(&raw);
        bytes
    }
}

/// Builds a data packet from `(tof, id)` records.
///
/// The header carries the usual packet-type byte and length fields so that
/// replayed files look like the live feed; decoders ignore them.
#[must_use]
pub fn encode_data_packet(records: &[(i32, i32)]) -> Vec<u8> {
    let payload = records.len() * RECORD_LEN;
    let mut bytes = Vec::with_capacity(DATA_HEADER_LEN + payload);
    bytes.resize(DATA_HEADER_LEN, 0);
    bytes[6] = 0x02;
    let total = u32::try_from(24 + payload).unwrap_or(u32::MAX);
    bytes[8..12].copy_from_slice(&total.to_le_bytes());
    bytes[12..16].copy_from_slice(&24u32.to_le_bytes());
    for &(tof, id) in records {
        bytes.extend_from_slice(&tof.to_le_bytes());
        bytes.extend_from_slice(&id.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_detection() {
        let codec = PacketCodec::default();
        let packet = codec.encode_command(2.5);
        assert_eq!(packet.len(), 48);
        assert!(PacketCodec::is_command(&packet));
        assert_eq!(codec.classify(&packet).unwrap(), Packet::Command { scale: 2.5 });
    }

    #[test]
    fn test_little_endian_scale() {
        let codec = PacketCodec::default()
            .with_byte_order(ByteOrder::LittleEndian)
            .with_scale_offset(36);
        assert_eq!(codec.min_command_len(), 44);
        let packet = codec.encode_command(-0.75);
        assert_eq!(codec.classify(&packet).unwrap(), Packet::Command { scale: -0.75 });
    }

    #[test]
    fn test_short_packets_rejected() {
        let codec = PacketCodec::default();
        let mut command = codec.encode_command(1.0);
        command.truncate(47);
        assert!(matches!(
            codec.classify(&command),
            Err(Error::PacketTooShort { len: 47, min: 48 })
        ));
        assert!(matches!(
            codec.classify(&[0u8; 20]),
            Err(Error::PacketTooShort { len: 20, min: 48 })
        ));
    }

    #[test]
    fn test_negative_records_dropped() {
        let bytes = encode_data_packet(&[(10, 1), (-1, 2), (30, -3), (40, 4)]);
        let Packet::Data(data) = PacketCodec::default().classify(&bytes).unwrap() else {
            panic!("expected data packet");
        };
        let mut batch = RawEventBatch::default();
        assert_eq!(data.decode_into(&mut batch), 2);
        assert_eq!(batch.tof, vec![10, 40]);
        assert_eq!(batch.pixel_id, vec![1, 4]);
    }
}
