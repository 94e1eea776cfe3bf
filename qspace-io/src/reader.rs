//! Memory-mapped event file readers.
//!
//! An event file is a flat sequence of little-endian `(tof: u32,
//! pixel_id: u32)` records, 8 bytes each, with no header.

use crate::{Error, Result};
use memmap2::Mmap;
use qspace_core::RawEventBatch;
use std::fs::File;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Size of one `(tof, pixel_id)` record in an event file.
pub const EVENT_RECORD_LEN: usize = 8;

/// A memory-mapped file reader.
///
/// Cloning is cheap: clones share the mapping, so segment workers can each
/// hold one.
#[derive(Clone)]
pub struct MappedFileReader {
    mmap: Arc<Mmap>,
    path: PathBuf,
}

impl MappedFileReader {
    /// Opens a file for memory-mapped reading.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or memory-mapped.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        // SAFETY: The file is opened read-only and we assume it is not modified concurrently.
        // This is the standard safety contract for memory mapping.
        #[allow(unsafe_code)]
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self {
            mmap: Arc::new(mmap),
            path: path.as_ref().to_path_buf(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the file contents as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap[..]
    }

    /// Returns the file size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// Returns true if the file is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }
}

/// Random access to the records of an event file.
#[derive(Clone)]
pub struct EventFileReader {
    reader: MappedFileReader,
}

impl EventFileReader {
    /// Opens and validates an event file.
    ///
    /// # Errors
    /// Returns [`Error::InvalidFormat`] if the file length is not a multiple
    /// of 8 bytes, or an I/O error if it cannot be mapped.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = MappedFileReader::open(path)?;
        if reader.len() % EVENT_RECORD_LEN != 0 {
            return Err(Error::InvalidFormat(format!(
                "{}: length {} is not a multiple of {EVENT_RECORD_LEN}",
                reader.path().display(),
                reader.len()
            )));
        }
        log::debug!(
            "opened event file {} ({} events)",
            reader.path().display(),
            reader.len() / EVENT_RECORD_LEN
        );
        Ok(Self { reader })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.reader.path()
    }

    #[must_use]
    pub fn num_events(&self) -> usize {
        self.reader.len() / EVENT_RECORD_LEN
    }

    /// Decodes the events in `range` (event indices, not bytes).
    ///
    /// # Errors
    /// Returns [`Error::InvalidFormat`] if the range reaches past the last
    /// event.
    pub fn read_range(&self, range: Range<usize>) -> Result<RawEventBatch> {
        if range.start > range.end || range.end > self.num_events() {
            return Err(Error::InvalidFormat(format!(
                "event range {range:?} outside file of {} events",
                self.num_events()
            )));
        }
        let bytes =
            &self.reader.as_bytes()[range.start * EVENT_RECORD_LEN..range.end * EVENT_RECORD_LEN];
        let mut batch = RawEventBatch::with_capacity(range.len());
        for record in bytes.chunks_exact(EVENT_RECORD_LEN) {
            let tof = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
            let id = u32::from_le_bytes([record[4], record[5], record[6], record[7]]);
            batch.push(tof, id);
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn file_with(bytes: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_read_range() {
        let mut bytes = Vec::new();
        for i in 0u32..5 {
            bytes.extend_from_slice(&(1000 + i).to_le_bytes());
            bytes.extend_from_slice(&(10 + i).to_le_bytes());
        }
        let file = file_with(&bytes);
        let reader = EventFileReader::open(file.path()).unwrap();
        assert_eq!(reader.num_events(), 5);

        let batch = reader.read_range(1..3).unwrap();
        let events: Vec<_> = batch.iter().map(|e| (e.tof, e.pixel_id)).collect();
        assert_eq!(events, vec![(1001, 11), (1002, 12)]);
        assert!(reader.read_range(4..6).is_err());
        assert!(reader.read_range(5..5).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_partial_record() {
        let file = file_with(&[0u8; 12]);
        assert!(matches!(
            EventFileReader::open(file.path()),
            Err(Error::InvalidFormat(_))
        ));
    }
}
