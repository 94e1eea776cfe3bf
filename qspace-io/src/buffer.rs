//! Fixed-capacity staging buffer for live events.

use qspace_core::RawEventBatch;
use qspace_instrument::DataPacket;

/// Default number of events held before a forced flush.
pub const DEFAULT_BUFFER_CAPACITY: usize = 200_000;
/// Default fill fraction at which the buffer asks to be flushed.
pub const DEFAULT_NEAR_FULL_FRACTION: f64 = 0.9;

/// Accumulates decoded `(tof, id)` records until they are taken as one
/// batch.
#[derive(Debug, Clone)]
pub struct EventBuffer {
    events: RawEventBatch,
    capacity: usize,
    near_full: usize,
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY, DEFAULT_NEAR_FULL_FRACTION)
    }
}

impl EventBuffer {
    /// Creates a buffer; `near_full_fraction` is clamped to `[0, 1]`.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn new(capacity: usize, near_full_fraction: f64) -> Self {
        let capacity = capacity.max(1);
        let near_full = (capacity as f64 * near_full_fraction.clamp(0.0, 1.0)).ceil() as usize;
        Self {
            events: RawEventBatch::with_capacity(capacity),
            capacity,
            near_full,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True if appending `additional` events would exceed the capacity.
    #[must_use]
    pub fn would_overflow(&self, additional: usize) -> bool {
        self.events.len() + additional > self.capacity
    }

    #[must_use]
    pub fn is_near_full(&self) -> bool {
        self.events.len() >= self.near_full
    }

    /// Decodes a data packet into the buffer; returns the number of records
    /// dropped for negative values.
    pub fn append_packet(&mut self, packet: &DataPacket<'_>) -> usize {
        packet.decode_into(&mut self.events)
    }

    /// Moves the buffered events out, leaving the buffer empty.
    pub fn take(&mut self) -> RawEventBatch {
        std::mem::replace(&mut self.events, RawEventBatch::with_capacity(self.capacity))
    }

    /// Discards buffered events.
    pub fn reset(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qspace_instrument::packet::encode_data_packet;
    use qspace_instrument::{Packet, PacketCodec};

    fn data(records: &[(i32, i32)]) -> Vec<u8> {
        encode_data_packet(records)
    }

    #[test]
    fn test_thresholds() {
        let mut buffer = EventBuffer::new(10, 0.9);
        let bytes = data(&[(1, 1); 8]);
        let Ok(Packet::Data(packet)) = PacketCodec::default().classify(&bytes) else {
            panic!("expected a data packet");
        };
        assert_eq!(buffer.append_packet(&packet), 0);
        assert!(!buffer.is_near_full());
        assert!(buffer.would_overflow(3));
        assert!(!buffer.would_overflow(2));

        let bytes = data(&[(5, 2), (-1, 3)]);
        let Ok(Packet::Data(packet)) = PacketCodec::default().classify(&bytes) else {
            panic!("expected a data packet");
        };
        assert_eq!(buffer.append_packet(&packet), 1);
        assert_eq!(buffer.len(), 9);
        assert!(buffer.is_near_full());

        let batch = buffer.take();
        assert_eq!(batch.len(), 9);
        assert!(buffer.is_empty());
    }
}
