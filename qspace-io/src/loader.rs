//! Segmented loading of event files.
//!
//! A load request is split into segments of at most
//! [`LoaderConfig::max_segment_events`] events (further capped by a memory
//! budget). Segments run in waves of `worker_count` threads; the caller
//! blocks until a wave completes and receives each segment as soon as it
//! and all earlier segments of the wave are ready.

use crate::reader::EventFileReader;
use crate::{Error, Result};
use qspace_core::RawEventBatch;
use std::ops::Range;
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use sysinfo::System;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Default upper bound on events per segment.
pub const DEFAULT_MAX_SEGMENT_EVENTS: usize = 2_000_000;
/// Default time a wave may take before the load is abandoned.
pub const DEFAULT_WAVE_TIMEOUT: Duration = Duration::from_secs(600);

/// A raw record plus the Q event it becomes downstream.
const BYTES_PER_EVENT: usize = 8 + 32;
const MEMORY_OVERHEAD_FACTOR: f64 = 1.2;

/// Segmentation and memory settings for [`FileEventLoader`].
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LoaderConfig {
    pub max_segment_events: usize,
    /// Fraction of available system memory to use (0.0-1.0].
    pub memory_fraction: f64,
    /// Explicit memory budget override (bytes). If set, `memory_fraction` is ignored.
    pub memory_budget_bytes: Option<usize>,
    pub wave_timeout: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_segment_events: DEFAULT_MAX_SEGMENT_EVENTS,
            memory_fraction: 0.5,
            memory_budget_bytes: None,
            wave_timeout: DEFAULT_WAVE_TIMEOUT,
        }
    }
}

impl LoaderConfig {
    #[must_use]
    pub fn with_max_segment_events(mut self, events: usize) -> Self {
        self.max_segment_events = events;
        self
    }

    #[must_use]
    pub fn with_memory_fraction(mut self, fraction: f64) -> Self {
        self.memory_fraction = fraction;
        self
    }

    #[must_use]
    pub fn with_memory_budget_bytes(mut self, bytes: usize) -> Self {
        self.memory_budget_bytes = Some(bytes);
        self
    }

    #[must_use]
    pub fn with_wave_timeout(mut self, timeout: Duration) -> Self {
        self.wave_timeout = timeout;
        self
    }

    /// Resolves the memory budget in bytes.
    ///
    /// # Errors
    /// Returns an error if `memory_fraction` is outside (0, 1] or the
    /// system reports no available memory.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn resolve_budget_bytes(&self) -> Result<usize> {
        if let Some(bytes) = self.memory_budget_bytes {
            return Ok(bytes);
        }
        if !(0.0 < self.memory_fraction && self.memory_fraction <= 1.0) {
            return Err(Error::InvalidConfig(
                "memory_fraction must be in (0.0, 1.0]".to_string(),
            ));
        }
        let mut system = System::new();
        system.refresh_memory();
        let available = system.available_memory();
        if available == 0 {
            return Err(Error::InvalidConfig(
                "available system memory reported as 0".to_string(),
            ));
        }
        let budget = (available as f64 * self.memory_fraction).floor() as u64;
        Ok(usize::try_from(budget).unwrap_or(usize::MAX))
    }

    /// Events per segment when `worker_count` segments are in flight.
    ///
    /// # Errors
    /// Returns an error for a zero segment size or an unresolvable budget.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn segment_events(&self, worker_count: usize) -> Result<usize> {
        if self.max_segment_events == 0 {
            return Err(Error::InvalidConfig(
                "max_segment_events must be positive".to_string(),
            ));
        }
        let budget = self.resolve_budget_bytes()?;
        let per_event = BYTES_PER_EVENT as f64 * MEMORY_OVERHEAD_FACTOR;
        let fit = (budget as f64 / (per_event * worker_count.max(1) as f64)).floor() as usize;
        Ok(fit.clamp(1, self.max_segment_events))
    }
}

/// Which part of a file to load.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LoadRequest {
    pub first_event: usize,
    pub count_to_load: usize,
    /// How many of the loaded events are also flagged for display.
    pub count_to_show: usize,
    pub worker_count: usize,
}

impl LoadRequest {
    #[must_use]
    pub fn new(first_event: usize, count_to_load: usize, count_to_show: usize) -> Self {
        Self {
            first_event,
            count_to_load,
            count_to_show,
            worker_count: 1,
        }
    }

    #[must_use]
    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.worker_count = workers;
        self
    }

    /// Clamps the counts to a file of `num_events` events. A first event
    /// past the end leaves nothing to load.
    #[must_use]
    pub fn clamped(self, num_events: usize) -> Self {
        let available = num_events.saturating_sub(self.first_event);
        let count_to_load = self.count_to_load.min(available);
        Self {
            first_event: self.first_event,
            count_to_load,
            count_to_show: self.count_to_show.min(count_to_load),
            worker_count: self.worker_count.max(1),
        }
    }
}

/// One loaded segment handed to the caller.
#[derive(Clone, Debug, PartialEq)]
pub struct LoadedSegment {
    /// Segment number within the load, from 0.
    pub index: usize,
    /// File index of the first event in `events`.
    pub first_event: usize,
    pub events: RawEventBatch,
    /// Leading events of this segment that fall within `count_to_show`.
    pub show: usize,
}

/// Totals of a completed load.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub loaded: usize,
    pub shown: usize,
    pub segments: usize,
}

/// Loads event files segment by segment on worker threads.
pub struct FileEventLoader {
    reader: EventFileReader,
    config: LoaderConfig,
}

impl FileEventLoader {
    /// Opens an event file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be mapped or has a partial
    /// record.
    pub fn open<P: AsRef<Path>>(path: P, config: LoaderConfig) -> Result<Self> {
        Ok(Self {
            reader: EventFileReader::open(path)?,
            config,
        })
    }

    #[must_use]
    pub fn num_events(&self) -> usize {
        self.reader.num_events()
    }

    #[must_use]
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Segment ranges for a clamped request.
    fn segments(&self, request: &LoadRequest) -> Result<Vec<Range<usize>>> {
        if request.count_to_load == 0 {
            return Ok(Vec::new());
        }
        let step = self.config.segment_events(request.worker_count)?;
        let end = request.first_event + request.count_to_load;
        Ok((request.first_event..end)
            .step_by(step)
            .map(|start| start..(start + step).min(end))
            .collect())
    }

    /// Loads the requested events, handing every segment to `sink` in file
    /// order.
    ///
    /// Segments already passed to `sink` stay delivered when a later one
    /// fails.
    ///
    /// # Errors
    /// Returns [`Error::SegmentLoad`] when a segment cannot be read and
    /// [`Error::WaveTimeout`] when a wave exceeds the configured timeout.
    pub fn load<F>(&self, request: LoadRequest, mut sink: F) -> Result<LoadSummary>
    where
        F: FnMut(LoadedSegment),
    {
        let request = request.clamped(self.num_events());
        let segments = self.segments(&request)?;
        log::info!(
            "loading {} events from {} starting at {} ({} segments, {} workers)",
            request.count_to_load,
            self.reader.path().display(),
            request.first_event,
            segments.len(),
            request.worker_count
        );

        let mut summary = LoadSummary::default();
        for (wave_index, wave) in segments.chunks(request.worker_count).enumerate() {
            let base = wave_index * request.worker_count;
            let reader = self.reader.clone();
            let result = self.run_wave(
                base,
                wave,
                move |range| reader.read_range(range),
                &mut |offset, events| {
                    let show = request
                        .count_to_show
                        .saturating_sub(summary.shown)
                        .min(events.len());
                    summary.loaded += events.len();
                    summary.shown += show;
                    summary.segments += 1;
                    log::debug!("segment {} loaded: {:?}", base + offset, wave[offset]);
                    sink(LoadedSegment {
                        index: base + offset,
                        first_event: wave[offset].start,
                        events,
                        show,
                    });
                },
            );
            if let Err(err) = result {
                log::error!("load aborted after {} segments: {err}", summary.segments);
                return Err(err);
            }
        }
        log::info!(
            "load finished: {} events in {} segments",
            summary.loaded,
            summary.segments
        );
        Ok(summary)
    }

    /// Reads one wave of segments in parallel, passing each to `deliver` as
    /// soon as it and every earlier segment of the wave are ready.
    ///
    /// When a segment fails, the segments before it are still awaited and
    /// delivered before the error is returned; later ones are dropped. A
    /// timeout keeps whatever in-order prefix was delivered.
    fn run_wave<R>(
        &self,
        base: usize,
        wave: &[Range<usize>],
        read: R,
        deliver: &mut dyn FnMut(usize, RawEventBatch),
    ) -> Result<()>
    where
        R: Fn(Range<usize>) -> Result<RawEventBatch> + Clone + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        for (offset, range) in wave.iter().enumerate() {
            let read = read.clone();
            let tx = tx.clone();
            let range = range.clone();
            thread::spawn(move || {
                let result = read(range);
                let _ = tx.send((offset, result));
            });
        }
        drop(tx);

        let timeout = self.config.wave_timeout;
        let deadline = Instant::now() + timeout;
        let mut pending: Vec<Option<RawEventBatch>> = Vec::with_capacity(wave.len());
        pending.resize_with(wave.len(), || None);
        let mut next = 0;
        let mut failure: Option<(usize, Error)> = None;
        while next < failure.as_ref().map_or(wave.len(), |(offset, _)| *offset) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((offset, Ok(batch))) => pending[offset] = Some(batch),
                Ok((offset, Err(err))) => {
                    log::warn!("segment {} failed: {err}", base + offset);
                    if failure.as_ref().is_none_or(|(first, _)| offset < *first) {
                        failure = Some((
                            offset,
                            Error::SegmentLoad {
                                segment: base + offset,
                                reason: err.to_string(),
                            },
                        ));
                    }
                }
                Err(RecvTimeoutError::Timeout) => return Err(Error::WaveTimeout(timeout)),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::SegmentLoad {
                        segment: base + next,
                        reason: "worker exited without a result".to_string(),
                    });
                }
            }
            while let Some(batch) = pending.get_mut(next).and_then(Option::take) {
                deliver(next, batch);
                next += 1;
            }
        }
        match failure {
            Some((_, err)) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::EventFileWriter;
    use tempfile::NamedTempFile;

    fn event_file(n: u32) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        let mut batch = RawEventBatch::default();
        for i in 0..n {
            batch.push(100 * i, i + 1);
        }
        let mut writer = EventFileWriter::create(file.path()).unwrap();
        writer.write_batch(&batch).unwrap();
        writer.finish().unwrap();
        file
    }

    #[test]
    fn test_request_clamping() {
        let request = LoadRequest::new(8, 100, 50).clamped(10);
        assert_eq!(request.count_to_load, 2);
        assert_eq!(request.count_to_show, 2);
        assert_eq!(request.worker_count, 1);

        let past_end = LoadRequest::new(12, 5, 5).clamped(10);
        assert_eq!(past_end.count_to_load, 0);
    }

    #[test]
    fn test_segment_size_from_budget() {
        let config = LoaderConfig::default().with_memory_budget_bytes(48 * 100);
        // 48 bytes per event with overhead, split over two workers
        assert_eq!(config.segment_events(2).unwrap(), 50);
        let config = config.with_max_segment_events(20);
        assert_eq!(config.segment_events(2).unwrap(), 20);
        let bad = LoaderConfig::default().with_memory_fraction(1.5);
        assert!(matches!(bad.resolve_budget_bytes(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_segments_arrive_in_order() {
        let file = event_file(10);
        let config = LoaderConfig::default()
            .with_max_segment_events(3)
            .with_memory_budget_bytes(1 << 20);
        let loader = FileEventLoader::open(file.path(), config).unwrap();

        let mut seen = Vec::new();
        let request = LoadRequest::new(0, 10, 4).with_worker_count(2);
        let summary = loader.load(request, |segment| seen.push(segment)).unwrap();
        assert_eq!(
            summary,
            LoadSummary {
                loaded: 10,
                shown: 4,
                segments: 4
            }
        );
        let starts: Vec<usize> = seen.iter().map(|s| s.first_event).collect();
        assert_eq!(starts, vec![0, 3, 6, 9]);
        let shows: Vec<usize> = seen.iter().map(|s| s.show).collect();
        assert_eq!(shows, vec![3, 1, 0, 0]);
        let ids: Vec<u32> = seen
            .iter()
            .flat_map(|s| s.events.iter().map(|e| e.pixel_id))
            .collect();
        assert_eq!(ids, (1..=10).collect::<Vec<_>>());
    }

    /// Reads through the real file except for the segment starting at
    /// `bad`, which fails, and the one starting at `slow`, which stalls.
    fn faulty_read(
        reader: EventFileReader,
        bad: usize,
        slow: usize,
    ) -> impl Fn(Range<usize>) -> Result<RawEventBatch> + Clone + Send + 'static {
        move |range: Range<usize>| {
            if range.start == slow {
                thread::sleep(Duration::from_secs(2));
            }
            if range.start == bad {
                return Err(Error::InvalidFormat("unreadable segment".to_string()));
            }
            reader.read_range(range)
        }
    }

    #[test]
    fn test_failed_segment_keeps_earlier_segments() {
        let file = event_file(8);
        let loader = FileEventLoader::open(file.path(), LoaderConfig::default()).unwrap();
        let wave = [0..2, 2..4, 4..6, 6..8];

        let mut delivered = Vec::new();
        let result = loader.run_wave(
            10,
            &wave,
            faulty_read(loader.reader.clone(), 4, usize::MAX),
            &mut |offset, events| delivered.push((offset, events.len())),
        );
        assert!(matches!(result, Err(Error::SegmentLoad { segment: 12, .. })));
        assert_eq!(delivered, vec![(0, 2), (1, 2)]);
    }

    #[test]
    fn test_timeout_keeps_in_order_prefix() {
        let file = event_file(8);
        let config = LoaderConfig::default().with_wave_timeout(Duration::from_millis(300));
        let loader = FileEventLoader::open(file.path(), config).unwrap();
        let wave = [0..2, 2..4, 4..6, 6..8];

        let mut delivered = Vec::new();
        let result = loader.run_wave(
            0,
            &wave,
            faulty_read(loader.reader.clone(), usize::MAX, 2),
            &mut |offset, _| delivered.push(offset),
        );
        assert!(matches!(result, Err(Error::WaveTimeout(_))));
        // segments after the stalled one may be ready but are never
        // delivered out of order
        assert_eq!(delivered, vec![0]);
    }

    #[test]
    fn test_nothing_to_load() {
        let file = event_file(4);
        let loader = FileEventLoader::open(file.path(), LoaderConfig::default()).unwrap();
        let mut calls = 0;
        let summary = loader
            .load(LoadRequest::new(4, 10, 10), |_| calls += 1)
            .unwrap();
        assert_eq!(summary, LoadSummary::default());
        assert_eq!(calls, 0);
    }
}
