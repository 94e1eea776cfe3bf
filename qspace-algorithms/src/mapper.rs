//! Parallel event-to-Q mapping.
//!
//! Large batches are cut into contiguous sub-ranges that are mapped
//! concurrently on the rayon pool. Each sub-range succeeds or fails on its
//! own; the caller receives every successful slice plus the errors of the
//! failed ones.

use std::ops::Range;
use std::sync::Arc;

use qspace_core::{QEventBatch, RawEventBatch};
use qspace_instrument::TofToQMap;
use rayon::prelude::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Event mapper configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MapperConfig {
    /// Batches longer than this are split into sub-ranges.
    pub parallel_threshold: usize,
    /// Number of sub-ranges for a split batch.
    pub num_tasks: usize,
    /// Fail a whole sub-range on the first invalid pixel id instead of
    /// skipping the event.
    pub strict: bool,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            parallel_threshold: 400_000,
            num_tasks: 4,
            strict: false,
        }
    }
}

impl MapperConfig {
    #[must_use]
    pub fn with_parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_num_tasks(mut self, num_tasks: usize) -> Self {
        self.num_tasks = num_tasks.max(1);
        self
    }

    #[must_use]
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

/// Mapped output of one sub-range.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedRange {
    /// Event range of the input batch this slice came from.
    pub range: Range<usize>,
    pub events: QEventBatch,
    /// Events dropped for an invalid pixel id.
    pub skipped: usize,
}

/// Per-sub-task results of one fan-out, in sub-range order.
#[derive(Debug, Default)]
pub struct TaskGroupOutcome {
    pub batches: Vec<MappedRange>,
    /// `(sub-range index, error)` for every failed sub-range.
    pub errors: Vec<(usize, Error)>,
}

impl TaskGroupOutcome {
    /// True if every sub-range succeeded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    /// Total number of mapped events.
    #[must_use]
    pub fn num_events(&self) -> usize {
        self.batches.iter().map(|b| b.events.len()).sum()
    }

    /// Total number of skipped events.
    #[must_use]
    pub fn num_skipped(&self) -> usize {
        self.batches.iter().map(|b| b.skipped).sum()
    }

    /// All successful slices concatenated in sub-range order.
    #[must_use]
    pub fn concat(&self) -> QEventBatch {
        let mut out = QEventBatch::with_capacity(self.num_events());
        for batch in &self.batches {
            out.append(&batch.events);
        }
        out
    }
}

/// Splits `len` events into `parts` contiguous ranges of `len / parts`
/// events; the last range absorbs the remainder.
#[must_use]
pub fn split_ranges(len: usize, parts: usize) -> Vec<Range<usize>> {
    let parts = parts.clamp(1, len.max(1));
    let step = len / parts;
    (0..parts)
        .map(|i| {
            let start = i * step;
            let end = if i + 1 == parts { len } else { start + step };
            start..end
        })
        .collect()
}

/// Maps raw events to Q using a shared lookup table.
#[derive(Debug, Clone)]
pub struct EventMapper {
    map: Arc<TofToQMap>,
    config: MapperConfig,
}

impl EventMapper {
    #[must_use]
    pub fn new(map: Arc<TofToQMap>, config: MapperConfig) -> Self {
        Self { map, config }
    }

    #[must_use]
    pub fn config(&self) -> &MapperConfig {
        &self.config
    }

    #[must_use]
    pub fn q_map(&self) -> &TofToQMap {
        &self.map
    }

    /// Maps a batch, splitting it when it exceeds the parallel threshold.
    #[must_use]
    pub fn map(&self, batch: &RawEventBatch) -> TaskGroupOutcome {
        let ranges = if batch.len() > self.config.parallel_threshold {
            split_ranges(batch.len(), self.config.num_tasks)
        } else {
            vec![0..batch.len()]
        };

        let results: Vec<Result<MappedRange>> = if ranges.len() > 1 {
            ranges
                .into_par_iter()
                .map(|range| self.map_range(batch, range))
                .collect()
        } else {
            ranges
                .into_iter()
                .map(|range| self.map_range(batch, range))
                .collect()
        };

        let mut outcome = TaskGroupOutcome::default();
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(mapped) => outcome.batches.push(mapped),
                Err(err) => {
                    log::warn!("mapping sub-range {index} failed: {err}");
                    outcome.errors.push((index, err));
                }
            }
        }
        outcome
    }

    fn map_range(&self, batch: &RawEventBatch, range: Range<usize>) -> Result<MappedRange> {
        let mut events = QEventBatch::with_capacity(range.len());
        let mut skipped = 0;
        for index in range.clone() {
            let (tof, pixel_id) = (batch.tof[index], batch.pixel_id[index]);
            match self.map.map_event(tof, pixel_id) {
                Some((q, weight)) => events.push_weighted(q, weight),
                None if self.config.strict => {
                    return Err(Error::InvalidPixel { index, pixel_id });
                }
                None => skipped += 1,
            }
        }
        Ok(MappedRange {
            range,
            events,
            skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_ranges_remainder() {
        let ranges = split_ranges(10, 4);
        assert_eq!(ranges, vec![0..2, 2..4, 4..6, 6..10]);
        assert_eq!(split_ranges(3, 8), vec![0..1, 1..2, 2..3]);
        assert_eq!(split_ranges(0, 4), vec![0..0]);
    }

    #[test]
    fn test_ranges_cover_everything_once() {
        for len in [1, 7, 400_001, 1_000_003] {
            for parts in 1..6 {
                let ranges = split_ranges(len, parts);
                assert_eq!(ranges.first().map(|r| r.start), Some(0));
                assert_eq!(ranges.last().map(|r| r.end), Some(len));
                for pair in ranges.windows(2) {
                    assert_eq!(pair[0].end, pair[1].start);
                }
            }
        }
    }
}
