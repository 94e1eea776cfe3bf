//! Event file writer.

use crate::reader::EVENT_RECORD_LEN;
use crate::Result;
use qspace_core::RawEventBatch;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Writes raw events in the flat `(tof, pixel_id)` little-endian layout
/// read by [`crate::EventFileReader`].
pub struct EventFileWriter {
    writer: BufWriter<File>,
    written: usize,
}

impl EventFileWriter {
    /// Creates (or truncates) an event file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        Ok(Self { writer, written: 0 })
    }

    /// Appends a batch of events.
    ///
    /// # Errors
    /// Returns an error if writing fails.
    pub fn write_batch(&mut self, batch: &RawEventBatch) -> Result<()> {
        let mut record = [0u8; EVENT_RECORD_LEN];
        for event in batch.iter() {
            record[..4].copy_from_slice(&event.tof.to_le_bytes());
            record[4..].copy_from_slice(&event.pixel_id.to_le_bytes());
            self.writer.write_all(&record)?;
        }
        self.written += batch.len();
        Ok(())
    }

    /// Number of events written so far.
    #[must_use]
    pub fn written(&self) -> usize {
        self.written
    }

    /// Flushes buffered records to disk.
    ///
    /// # Errors
    /// Returns an error if the flush fails.
    pub fn finish(mut self) -> Result<usize> {
        self.writer.flush()?;
        Ok(self.written)
    }
}
