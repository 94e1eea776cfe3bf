//! Column-wise event batches.
//!
//! Raw detector events and their reciprocal-space images are stored as
//! structure-of-arrays batches. A batch is the unit of parallel dispatch
//! and of histogram accumulation; accumulation is additive, so batches can
//! be applied in any order.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::geometry::Vec3;

/// A single raw detector event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RawEvent {
    /// Time-of-flight in 100 ns clock ticks.
    pub tof: u32,
    /// Global detector pixel id (1-based).
    pub pixel_id: u32,
}

/// A batch of raw (time-of-flight, pixel id) events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RawEventBatch {
    /// Time-of-flight column (100 ns ticks).
    pub tof: Vec<u32>,
    /// Pixel id column.
    pub pixel_id: Vec<u32>,
}

impl RawEventBatch {
    /// Creates a new empty batch with specified capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tof: Vec::with_capacity(capacity),
            pixel_id: Vec::with_capacity(capacity),
        }
    }

    /// Builds a batch from already-split columns.
    ///
    /// # Errors
    /// Returns an error if the columns differ in length.
    pub fn from_columns(tof: Vec<u32>, pixel_id: Vec<u32>) -> crate::Result<Self> {
        if tof.len() != pixel_id.len() {
            return Err(crate::Error::MismatchedColumns(format!(
                "tof={}, pixel_id={}",
                tof.len(),
                pixel_id.len()
            )));
        }
        Ok(Self { tof, pixel_id })
    }

    /// Returns the number of events in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tof.len()
    }

    /// Returns true if the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tof.is_empty()
    }

    pub fn clear(&mut self) {
        self.tof.clear();
        self.pixel_id.clear();
    }

    pub fn push(&mut self, tof: u32, pixel_id: u32) {
        self.tof.push(tof);
        self.pixel_id.push(pixel_id);
    }

    pub fn append(&mut self, other: &RawEventBatch) {
        self.tof.extend_from_slice(&other.tof);
        self.pixel_id.extend_from_slice(&other.pixel_id);
    }

    /// Returns the event at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<RawEvent> {
        Some(RawEvent {
            tof: *self.tof.get(index)?,
            pixel_id: *self.pixel_id.get(index)?,
        })
    }

    /// Copies a contiguous sub-range into a new batch.
    #[must_use]
    pub fn slice(&self, range: std::ops::Range<usize>) -> Self {
        let end = range.end.min(self.len());
        let start = range.start.min(end);
        Self {
            tof: self.tof[start..end].to_vec(),
            pixel_id: self.pixel_id[start..end].to_vec(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = RawEvent> + '_ {
        self.tof
            .iter()
            .zip(&self.pixel_id)
            .map(|(&tof, &pixel_id)| RawEvent { tof, pixel_id })
    }
}

impl FromIterator<RawEvent> for RawEventBatch {
    fn from_iter<I: IntoIterator<Item = RawEvent>>(iter: I) -> Self {
        let mut batch = Self::default();
        for event in iter {
            batch.push(event.tof, event.pixel_id);
        }
        batch
    }
}

/// A batch of events mapped into reciprocal space.
///
/// Q components are in inverse Angstroms and include the factor of 2π.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct QEventBatch {
    pub qx: Vec<f64>,
    pub qy: Vec<f64>,
    pub qz: Vec<f64>,
    /// Per-event weight; 1.0 unless reweighted.
    pub weight: Vec<f64>,
}

impl QEventBatch {
    /// Creates a new empty batch with specified capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            qx: Vec::with_capacity(capacity),
            qy: Vec::with_capacity(capacity),
            qz: Vec::with_capacity(capacity),
            weight: Vec::with_capacity(capacity),
        }
    }

    /// Returns the number of events in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.qx.len()
    }

    /// Returns true if the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.qx.is_empty()
    }

    pub fn clear(&mut self) {
        self.qx.clear();
        self.qy.clear();
        self.qz.clear();
        self.weight.clear();
    }

    /// Pushes an event with unit weight.
    pub fn push(&mut self, q: Vec3) {
        self.push_weighted(q, 1.0);
    }

    pub fn push_weighted(&mut self, q: Vec3, weight: f64) {
        self.qx.push(q.x);
        self.qy.push(q.y);
        self.qz.push(q.z);
        self.weight.push(weight);
    }

    pub fn append(&mut self, other: &QEventBatch) {
        self.qx.extend_from_slice(&other.qx);
        self.qy.extend_from_slice(&other.qy);
        self.qz.extend_from_slice(&other.qz);
        self.weight.extend_from_slice(&other.weight);
    }

    /// Returns the Q vector of the event at `index`.
    #[must_use]
    pub fn q(&self, index: usize) -> Vec3 {
        Vec3::new(self.qx[index], self.qy[index], self.qz[index])
    }

    /// Iterates over `(q, weight)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (Vec3, f64)> + '_ {
        (0..self.len()).map(move |i| (self.q(i), self.weight[i]))
    }

    /// Copies a contiguous sub-range into a new batch.
    #[must_use]
    pub fn slice(&self, range: std::ops::Range<usize>) -> Self {
        let end = range.end.min(self.len());
        let start = range.start.min(end);
        Self {
            qx: self.qx[start..end].to_vec(),
            qy: self.qy[start..end].to_vec(),
            qz: self.qz[start..end].to_vec(),
            weight: self.weight[start..end].to_vec(),
        }
    }

    /// Concatenates batches in order.
    #[must_use]
    pub fn concat(batches: &[QEventBatch]) -> Self {
        let total = batches.iter().map(QEventBatch::len).sum();
        let mut all = Self::with_capacity(total);
        for batch in batches {
            all.append(batch);
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_batch_operations() {
        let mut batch = RawEventBatch::with_capacity(4);
        assert!(batch.is_empty());
        batch.push(1000, 7);
        batch.push(1200, 9);
        assert_eq!(batch.len(), 2);
        assert_eq!(
            batch.get(1),
            Some(RawEvent {
                tof: 1200,
                pixel_id: 9
            })
        );
        assert_eq!(batch.slice(1..5).len(), 1);
        batch.clear();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_raw_batch_mismatched_columns() {
        assert!(RawEventBatch::from_columns(vec![1, 2], vec![1]).is_err());
    }

    #[test]
    fn test_q_batch_concat_preserves_order() {
        let mut a = QEventBatch::default();
        a.push(Vec3::new(1.0, 0.0, 0.0));
        let mut b = QEventBatch::default();
        b.push_weighted(Vec3::new(0.0, 2.0, 0.0), 0.5);
        let all = QEventBatch::concat(&[a, b]);
        assert_eq!(all.len(), 2);
        assert_eq!(all.q(1), Vec3::new(0.0, 2.0, 0.0));
        assert!((all.weight[1] - 0.5).abs() < f64::EPSILON);
    }
}
