//! Per-peak event partitioning.
//!
//! A [`PeakEventList`] selects, from the events of one detector, the events
//! that belong to a single indexed peak. The box is seeded from events
//! whose fractional hkl is close to the peak's hkl, then applied to every
//! event of the detector.

use std::collections::HashMap;

use ndarray::Array3;
use qspace_core::{Mat3, MillerIndex, Peak, RawEventBatch, Vec3};
use qspace_instrument::{InstrumentCalibration, TofToQMap};

use crate::{Error, Result};

/// Slices along the third axis of the recentring window.
pub const WINDOW_SLICES: usize = 3;
/// Smallest window mass that can move the centre of mass.
pub const MIN_CENTER_OF_MASS: f64 = 4.0;

/// One event with its detector coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventInfo {
    /// Q / 2π.
    pub q: Vec3,
    pub pixel_id: u32,
    pub detector_id: u32,
    /// 1-based row.
    pub row: usize,
    /// 1-based column.
    pub col: usize,
    /// Time of flight in 100 ns ticks.
    pub tof: u32,
    /// Wavelength in Angstroms.
    pub wavelength: f64,
}

impl EventInfo {
    #[must_use]
    pub fn mag_q(&self) -> f64 {
        self.q.length()
    }

    /// Builds event records for a raw batch; events with unknown pixel ids
    /// are dropped.
    #[must_use]
    pub fn from_raw(
        batch: &RawEventBatch,
        calibration: &InstrumentCalibration,
        map: &TofToQMap,
    ) -> Vec<EventInfo> {
        let scale = 1.0 / std::f64::consts::TAU;
        batch
            .iter()
            .filter_map(|ev| {
                let location = calibration.pixel(ev.pixel_id)?;
                let q = map.q_of(ev.tof, ev.pixel_id)?;
                Some(EventInfo {
                    q: q * scale,
                    pixel_id: ev.pixel_id,
                    detector_id: location.detector_id,
                    row: location.row,
                    col: location.col,
                    tof: ev.tof,
                    wavelength: map.wavelength(ev.tof, ev.pixel_id).unwrap_or(0.0),
                })
            })
            .collect()
    }
}

/// Third coordinate of the partition box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowAxis {
    /// `|Q|` in units of Q / 2π.
    MagQ,
    /// Time of flight in 100 ns ticks.
    Tof,
}

impl WindowAxis {
    fn value(self, event: &EventInfo) -> f64 {
        match self {
            WindowAxis::MagQ => event.mag_q(),
            WindowAxis::Tof => f64::from(event.tof),
        }
    }
}

/// Footprint of the recentring histogram.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WindowShape {
    #[default]
    Circle,
    Square,
}

/// Working centre of a partitioned peak.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakCenter {
    pub row: f64,
    pub col: f64,
}

impl PeakCenter {
    /// Moves a peak to this centre.
    pub fn apply_to(self, peak: &mut Peak) {
        peak.row = self.row;
        peak.col = self.col;
    }
}

/// Inclusive `[min, max]` interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    fn empty() -> Self {
        Self {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn include(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    #[must_use]
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    #[must_use]
    pub fn range(&self) -> f64 {
        self.max - self.min
    }

    /// Integer-aligned window of the observed width centred on `center`.
    fn recenter(&self, center: f64) -> Self {
        let radius = (self.range() + 1.0) / 2.0;
        Self {
            min: (center - radius).floor(),
            max: (center + radius).ceil(),
        }
    }

    fn widen(&self, below: f64, above: f64) -> Self {
        let range = self.range();
        Self {
            min: self.min - below * range,
            max: self.max + above * range,
        }
    }
}

/// Events of one peak plus the box that selected them.
#[derive(Debug, Clone)]
pub struct PeakEventList<'a> {
    peak: &'a Peak,
    events: Vec<EventInfo>,
    axis: WindowAxis,
    rows: Bounds,
    cols: Bounds,
    values: Bounds,
    center: PeakCenter,
}

impl<'a> PeakEventList<'a> {
    /// Partitions with the box's third axis on `|Q|`.
    ///
    /// The |Q| range is widened by 2/5 of its width below and 1/5 above.
    ///
    /// # Errors
    /// [`Error::NotIndexed`] if the peak has no hkl and
    /// [`Error::NoEventsInTolerance`] if no hkl event lies within
    /// `tolerance` of it.
    pub fn q_aligned(
        peak: &'a Peak,
        tolerance: f64,
        ub_inverse: &Mat3,
        hkl_events: &[EventInfo],
        det_events: &[EventInfo],
    ) -> Result<Self> {
        Self::build(
            peak,
            tolerance,
            ub_inverse,
            hkl_events,
            det_events,
            WindowAxis::MagQ,
        )
    }

    /// Partitions with the box's third axis on time of flight.
    ///
    /// The TOF range is widened by 1/5 below and 2/5 above.
    ///
    /// # Errors
    /// As [`PeakEventList::q_aligned`].
    pub fn tof_aligned(
        peak: &'a Peak,
        tolerance: f64,
        ub_inverse: &Mat3,
        hkl_events: &[EventInfo],
        det_events: &[EventInfo],
    ) -> Result<Self> {
        Self::build(
            peak,
            tolerance,
            ub_inverse,
            hkl_events,
            det_events,
            WindowAxis::Tof,
        )
    }

    fn build(
        peak: &'a Peak,
        tolerance: f64,
        ub_inverse: &Mat3,
        hkl_events: &[EventInfo],
        det_events: &[EventInfo],
        axis: WindowAxis,
    ) -> Result<Self> {
        let target = peak.hkl.ok_or(Error::NotIndexed(peak.seqn))?;
        let target_vec = target.to_vec();

        let (mut rows, mut cols, mut values) = (Bounds::empty(), Bounds::empty(), Bounds::empty());
        let mut found = 0usize;
        for event in hkl_events {
            let hkl = *ub_inverse * event.q;
            if (hkl - target_vec).length() < tolerance {
                rows.include(index_f64(event.row));
                cols.include(index_f64(event.col));
                values.include(axis.value(event));
                found += 1;
            }
        }
        if found == 0 {
            return Err(Error::NoEventsInTolerance {
                hkl: target.to_string(),
                tolerance,
            });
        }

        let rows = rows.recenter(peak.row);
        let cols = cols.recenter(peak.col);
        let values = match axis {
            WindowAxis::MagQ => values.widen(0.4, 0.2),
            WindowAxis::Tof => values.widen(0.2, 0.4),
        };

        let events: Vec<EventInfo> = det_events
            .iter()
            .filter(|ev| {
                rows.contains(index_f64(ev.row))
                    && cols.contains(index_f64(ev.col))
                    && values.contains(axis.value(ev))
            })
            .copied()
            .collect();
        log::trace!(
            "peak {} ({target}): {found} seed events, {} in box",
            peak.seqn,
            events.len()
        );

        Ok(Self {
            peak,
            events,
            axis,
            rows,
            cols,
            values,
            center: PeakCenter {
                row: peak.row,
                col: peak.col,
            },
        })
    }

    #[must_use]
    pub fn peak(&self) -> &Peak {
        self.peak
    }

    #[must_use]
    pub fn events(&self) -> &[EventInfo] {
        &self.events
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
    pub fn axis(&self) -> WindowAxis {
        self.axis
    }

    #[must_use]
    pub fn row_bounds(&self) -> Bounds {
        self.rows
    }

    #[must_use]
    pub fn col_bounds(&self) -> Bounds {
        self.cols
    }

    /// Bounds on `|Q|` or TOF, depending on [`Self::axis`].
    #[must_use]
    pub fn value_bounds(&self) -> Bounds {
        self.values
    }

    #[must_use]
    pub fn center(&self) -> PeakCenter {
        self.center
    }

    /// Slice of an event when the value bounds are cut into `slices`
    /// equal parts.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn slice_of(&self, event: &EventInfo, slices: usize) -> usize {
        let width = self.values.range() / index_f64(slices);
        if width > 0.0 {
            let s = ((self.axis.value(event) - self.values.min) / width).floor();
            (s.max(0.0) as usize).min(slices - 1)
        } else {
            slices / 2
        }
    }

    /// Histogram `[slice][row][col]` of the events around the working
    /// centre, `2 * half_width + 1` cells square, with `slices` slices
    /// across the value bounds.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn window_histogram(
        &self,
        half_width: usize,
        shape: WindowShape,
        slices: usize,
    ) -> Array3<f64> {
        let size = 2 * half_width + 1;
        let slices = slices.max(1);
        let mut hist = Array3::zeros((slices, size, size));
        let w = index_f64(half_width);

        for event in &self.events {
            let dr = (index_f64(event.row) - self.center.row).round();
            let dc = (index_f64(event.col) - self.center.col).round();
            if dr.abs() > w || dc.abs() > w {
                continue;
            }
            if shape == WindowShape::Circle && dr * dr + dc * dc > w * w {
                continue;
            }
            let slice = self.slice_of(event, slices);
            hist[[slice, (dr + w) as usize, (dc + w) as usize]] += 1.0;
        }
        hist
    }

    /// Histogram `[slice][row][col]` over the whole partition box; row and
    /// column 0 are the box minimum.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn full_histogram(&self, slices: usize) -> Array3<f64> {
        let slices = slices.max(1);
        let n_rows = (self.rows.range().max(0.0) as usize) + 1;
        let n_cols = (self.cols.range().max(0.0) as usize) + 1;
        let mut hist = Array3::zeros((slices, n_rows, n_cols));
        for event in &self.events {
            let row = (index_f64(event.row) - self.rows.min) as usize;
            let col = (index_f64(event.col) - self.cols.min) as usize;
            let slice = self.slice_of(event, slices);
            if let Some(cell) = hist.get_mut([slice, row, col]) {
                *cell += 1.0;
            }
        }
        hist
    }

    /// Moves the working centre to the window's centre of mass.
    ///
    /// Returns `false` and leaves the centre alone when the window mass is
    /// not above [`MIN_CENTER_OF_MASS`].
    pub fn set_center_to_center_of_mass(&mut self, half_width: usize, shape: WindowShape) -> bool {
        let hist = self.window_histogram(half_width, shape, WINDOW_SLICES);
        let (mut mass, mut row_moment, mut col_moment) = (0.0, 0.0, 0.0);
        for ((_, r, c), &v) in hist.indexed_iter() {
            mass += v;
            row_moment += index_f64(r) * v;
            col_moment += index_f64(c) * v;
        }
        if mass <= MIN_CENTER_OF_MASS {
            return false;
        }
        let w = index_f64(half_width);
        self.center.row += row_moment / mass - w;
        self.center.col += col_moment / mass - w;
        true
    }

    /// Moves the working centre to the maximum of the window's row and
    /// column projections.
    ///
    /// Returns `false` and leaves the centre alone when either maximum is
    /// at index 0.
    pub fn set_center_to_max(&mut self, half_width: usize, shape: WindowShape) -> bool {
        let hist = self.window_histogram(half_width, shape, WINDOW_SLICES);
        let size = 2 * half_width + 1;
        let (mut row_sums, mut col_sums) = (vec![0.0; size], vec![0.0; size]);
        for ((_, r, c), &v) in hist.indexed_iter() {
            row_sums[r] += v;
            col_sums[c] += v;
        }
        let (row_max, col_max) = (argmax(&row_sums), argmax(&col_sums));
        if row_max == 0 || col_max == 0 {
            return false;
        }
        let w = index_f64(half_width);
        self.center.row += index_f64(row_max) - w;
        self.center.col += index_f64(col_max) - w;
        true
    }

    /// Ends the partition, returning the working centre so it can be
    /// applied to the peak.
    #[must_use]
    pub fn commit(self) -> PeakCenter {
        self.center
    }
}

/// First index of the largest value.
fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

#[allow(clippy::cast_precision_loss)]
fn index_f64(i: usize) -> f64 {
    i as f64
}

/// Groups events by detector id; events with `detector_id >= max_id` are
/// dropped. The result is indexed by detector id.
#[must_use]
pub fn split_events_by_id(events: &[EventInfo], max_id: u32) -> Vec<Vec<EventInfo>> {
    let mut groups = vec![Vec::new(); max_id as usize];
    for event in events {
        if let Some(group) = groups.get_mut(event.detector_id as usize) {
            group.push(*event);
        }
    }
    groups
}

/// Groups events by their rounded hkl; events at `(0, 0, 0)` are dropped.
#[must_use]
pub fn split_events_by_hkl(
    ub_inverse: &Mat3,
    events: &[EventInfo],
) -> HashMap<MillerIndex, Vec<EventInfo>> {
    let mut groups: HashMap<MillerIndex, Vec<EventInfo>> = HashMap::new();
    for event in events {
        let hkl = MillerIndex::round(*ub_inverse * event.q);
        if !hkl.is_origin() {
            groups.entry(hkl).or_default().push(*event);
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn event(row: usize, col: usize, q: Vec3) -> EventInfo {
        EventInfo {
            q,
            pixel_id: 0,
            detector_id: 1,
            row,
            col,
            tof: 10_000,
            wavelength: 1.0,
        }
    }

    fn indexed_peak() -> Peak {
        let mut peak = Peak::on_detector(1, 50.0, 60.0, 0.0);
        peak.hkl = Some(MillerIndex::new(1, 0, 0));
        peak
    }

    #[test]
    fn test_box_from_hkl_events() {
        let peak = indexed_peak();
        // identity UB: hkl == q
        let hkl_events = vec![
            event(48, 59, Vec3::new(0.95, 0.0, 0.0)),
            event(52, 61, Vec3::new(1.05, 0.0, 0.0)),
            event(70, 70, Vec3::new(1.4, 0.0, 0.0)),
        ];
        let det_events = vec![
            event(50, 60, Vec3::new(1.0, 0.0, 0.0)),
            event(47, 58, Vec3::new(0.97, 0.0, 0.0)),
            event(50, 60, Vec3::new(0.6, 0.0, 0.0)),
            event(40, 60, Vec3::new(1.0, 0.0, 0.0)),
        ];
        let list =
            PeakEventList::q_aligned(&peak, 0.2, &Mat3::identity(), &hkl_events, &det_events)
                .unwrap();

        // rows 48..52 -> radius 2.5 around 50
        assert_relative_eq!(list.row_bounds().min, 47.0);
        assert_relative_eq!(list.row_bounds().max, 53.0);
        assert_relative_eq!(list.col_bounds().min, 58.0);
        assert_relative_eq!(list.col_bounds().max, 62.0);
        assert_relative_eq!(list.value_bounds().min, 0.95 - 0.04, epsilon = 1e-12);
        assert_relative_eq!(list.value_bounds().max, 1.05 + 0.02, epsilon = 1e-12);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_tof_box_widens_upwards() {
        let peak = indexed_peak();
        let mut a = event(50, 60, Vec3::new(1.0, 0.0, 0.0));
        let mut b = a;
        a.tof = 1000;
        b.tof = 1100;
        let list = PeakEventList::tof_aligned(&peak, 0.1, &Mat3::identity(), &[a, b], &[a, b])
            .unwrap();
        assert_relative_eq!(list.value_bounds().min, 980.0);
        assert_relative_eq!(list.value_bounds().max, 1140.0);
    }

    #[test]
    fn test_no_events_in_tolerance() {
        let peak = indexed_peak();
        let events = vec![event(50, 60, Vec3::new(1.3, 0.0, 0.0))];
        let err = PeakEventList::q_aligned(&peak, 0.2, &Mat3::identity(), &events, &events)
            .unwrap_err();
        assert!(matches!(err, Error::NoEventsInTolerance { .. }));
    }

    #[test]
    fn test_unindexed_peak() {
        let peak = Peak::on_detector(1, 50.0, 60.0, 0.0);
        let err = PeakEventList::q_aligned(&peak, 0.2, &Mat3::identity(), &[], &[]).unwrap_err();
        assert!(matches!(err, Error::NotIndexed(0)));
    }

    #[test]
    fn test_center_of_mass_moves() {
        let peak = indexed_peak();
        let seed = [event(49, 59, Vec3::X), event(51, 61, Vec3::new(1.01, 0.0, 0.0))];
        let det: Vec<EventInfo> = (0..5).map(|_| event(51, 60, Vec3::X)).collect();
        let mut list =
            PeakEventList::q_aligned(&peak, 0.1, &Mat3::identity(), &seed, &det).unwrap();
        assert!(list.set_center_to_center_of_mass(2, WindowShape::Square));
        let mut moved = indexed_peak();
        list.commit().apply_to(&mut moved);
        assert_relative_eq!(moved.row, 51.0);
        assert_relative_eq!(moved.col, 60.0);
    }

    #[test]
    fn test_center_of_max_guard() {
        let peak = indexed_peak();
        let seed = [event(48, 58, Vec3::X), event(52, 62, Vec3::X)];
        let det = vec![event(48, 61, Vec3::X), event(48, 61, Vec3::X)];
        let mut list =
            PeakEventList::q_aligned(&peak, 0.1, &Mat3::identity(), &seed, &det).unwrap();
        // maximum row is on the window edge
        assert!(!list.set_center_to_max(2, WindowShape::Square));
        assert_eq!(list.center(), PeakCenter { row: 50.0, col: 60.0 });
    }

    #[test]
    fn test_split_by_hkl_skips_origin() {
        let events = vec![
            event(1, 1, Vec3::new(0.1, 0.0, 0.0)),
            event(1, 1, Vec3::new(0.9, 1.1, 0.0)),
            event(1, 1, Vec3::new(1.2, 0.8, 0.1)),
        ];
        let groups = split_events_by_hkl(&Mat3::identity(), &events);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[&MillerIndex::new(1, 1, 0)].len(), 2);
    }

    #[test]
    fn test_split_by_id() {
        let mut events = vec![event(1, 1, Vec3::X); 3];
        events[1].detector_id = 4;
        events[2].detector_id = 9;
        let groups = split_events_by_id(&events, 5);
        assert_eq!(groups.len(), 5);
        assert_eq!(groups[1].len(), 1);
        assert_eq!(groups[4].len(), 1);
    }
}
