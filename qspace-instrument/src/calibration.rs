//! Instrument calibration: flight path, time offset and detector grids.
//!
//! Calibrations are loaded from JSON:
//!
//! ```json
//! {
//!   "instrument": "TOPAZ",
//!   "l1": 18.0,
//!   "t0_shift": 0.0,
//!   "detectors": [
//!     { "id": 17, "rows": 256, "cols": 256, "width": 0.157, "height": 0.157,
//!       "center": [0.0, 0.39, 0.0], "base": [1.0, 0.0, 0.0], "up": [0.0, 0.0, 1.0] }
//!   ],
//!   "spectrum": [1.0, 1.0]
//! }
//! ```

use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use qspace_core::Vec3;
use serde::Deserialize;

use crate::grid::DetectorGrid;
use crate::instrument::Instrument;
use crate::{Error, Result};

/// Where a pixel id lands on the instrument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelLocation {
    pub detector_id: u32,
    /// 1-based row.
    pub row: usize,
    /// 1-based column.
    pub col: usize,
    /// Position relative to the sample, in meters.
    pub position: Vec3,
}

/// Validated geometry of one instrument.
///
/// Pixel ids start at `first_pixel_id` and run grid by grid in the order
/// the grids are listed; inside a grid they are column-major, so
/// `id = first + (col - 1) * rows + (row - 1)`.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentCalibration {
    instrument: Instrument,
    l1: f64,
    t0_shift: f64,
    first_pixel_id: u32,
    grids: Vec<DetectorGrid>,
    grid_starts: Vec<u32>,
    spectrum: Option<Vec<f64>>,
}

#[derive(Deserialize)]
struct JsonCalibration {
    instrument: String,
    l1: f64,
    #[serde(default)]
    t0_shift: f64,
    #[serde(default = "default_first_pixel_id")]
    first_pixel_id: u32,
    detectors: Vec<JsonDetector>,
    #[serde(default)]
    spectrum: Option<Vec<f64>>,
}

fn default_first_pixel_id() -> u32 {
    1
}

#[derive(Deserialize)]
struct JsonDetector {
    id: u32,
    rows: usize,
    cols: usize,
    width: f64,
    height: f64,
    #[serde(default)]
    depth: f64,
    center: [f64; 3],
    base: [f64; 3],
    up: [f64; 3],
}

impl InstrumentCalibration {
    /// Builds a calibration with ids starting at 1.
    ///
    /// # Errors
    /// Returns [`Error::InvalidCalibration`] if `l1` is not positive, no
    /// grids are given, or two grids share an id.
    pub fn new(
        instrument: Instrument,
        l1: f64,
        t0_shift: f64,
        grids: Vec<DetectorGrid>,
    ) -> Result<Self> {
        Self::build(instrument, l1, t0_shift, 1, grids, None)
    }

    fn build(
        instrument: Instrument,
        l1: f64,
        t0_shift: f64,
        first_pixel_id: u32,
        grids: Vec<DetectorGrid>,
        spectrum: Option<Vec<f64>>,
    ) -> Result<Self> {
        if !(l1 > 0.0 && l1.is_finite()) {
            return Err(Error::InvalidCalibration(format!(
                "L1 must be positive, got {l1}"
            )));
        }
        if !t0_shift.is_finite() {
            return Err(Error::InvalidCalibration("T0 shift is not finite".into()));
        }
        if grids.is_empty() {
            return Err(Error::InvalidCalibration("no detector grids".into()));
        }
        if first_pixel_id == 0 {
            return Err(Error::InvalidCalibration(
                "pixel ids must start at 1 or later".into(),
            ));
        }
        let mut seen = HashSet::new();
        let mut grid_starts = Vec::with_capacity(grids.len());
        let mut next = u64::from(first_pixel_id);
        for grid in &grids {
            if !seen.insert(grid.id) {
                return Err(Error::InvalidCalibration(format!(
                    "duplicate detector id {}",
                    grid.id
                )));
            }
            let start = u32::try_from(next).map_err(|_| {
                Error::InvalidCalibration("pixel ids overflow 32 bits".into())
            })?;
            grid_starts.push(start);
            next += grid.num_pixels() as u64;
        }
        if next > u64::from(u32::MAX) {
            return Err(Error::InvalidCalibration(
                "pixel ids overflow 32 bits".into(),
            ));
        }
        if let Some(values) = &spectrum {
            if values.iter().any(|v| !v.is_finite()) {
                return Err(Error::InvalidCalibration(
                    "spectrum contains non-finite values".into(),
                ));
            }
        }
        Ok(Self {
            instrument,
            l1,
            t0_shift,
            first_pixel_id,
            grids,
            grid_starts,
            spectrum,
        })
    }

    /// Loads a calibration from a JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// fails validation.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let json: JsonCalibration = serde_json::from_reader(BufReader::new(file))?;
        Self::from_json_calibration(json)
    }

    /// Loads a calibration from a JSON string.
    ///
    /// # Errors
    /// Returns an error if the JSON is malformed or fails validation.
    pub fn from_json(json: &str) -> Result<Self> {
        let json: JsonCalibration = serde_json::from_str(json)?;
        Self::from_json_calibration(json)
    }

    fn from_json_calibration(json: JsonCalibration) -> Result<Self> {
        let instrument: Instrument = json.instrument.parse()?;
        let grids = json
            .detectors
            .into_iter()
            .map(|d| {
                DetectorGrid {
                    id: d.id,
                    num_rows: d.rows,
                    num_cols: d.cols,
                    width: d.width,
                    height: d.height,
                    depth: d.depth,
                    center: d.center.into(),
                    base: d.base.into(),
                    up: d.up.into(),
                }
                .validated()
            })
            .collect::<Result<Vec<_>>>()?;
        let calibration = Self::build(
            instrument,
            json.l1,
            json.t0_shift,
            json.first_pixel_id,
            grids,
            json.spectrum,
        )?;
        log::debug!(
            "loaded {} calibration: {} grids, {} pixels",
            calibration.instrument,
            calibration.grids.len(),
            calibration.num_pixels()
        );
        Ok(calibration)
    }

    /// Attaches a tabulated incident spectrum (100 samples per Angstrom).
    ///
    /// # Errors
    /// Returns an error if a value is not finite.
    pub fn with_spectrum(self, spectrum: Vec<f64>) -> Result<Self> {
        Self::build(
            self.instrument,
            self.l1,
            self.t0_shift,
            self.first_pixel_id,
            self.grids,
            Some(spectrum),
        )
    }

    #[must_use]
    pub fn instrument(&self) -> Instrument {
        self.instrument
    }

    /// Source-to-sample distance in meters.
    #[must_use]
    pub fn l1(&self) -> f64 {
        self.l1
    }

    /// Time-of-flight offset in microseconds.
    #[must_use]
    pub fn t0_shift(&self) -> f64 {
        self.t0_shift
    }

    #[must_use]
    pub fn first_pixel_id(&self) -> u32 {
        self.first_pixel_id
    }

    #[must_use]
    pub fn grids(&self) -> &[DetectorGrid] {
        &self.grids
    }

    #[must_use]
    pub fn grid(&self, detector_id: u32) -> Option<&DetectorGrid> {
        self.grids.iter().find(|g| g.id == detector_id)
    }

    #[must_use]
    pub fn spectrum(&self) -> Option<&[f64]> {
        self.spectrum.as_deref()
    }

    #[must_use]
    pub fn num_pixels(&self) -> usize {
        self.grids.iter().map(DetectorGrid::num_pixels).sum()
    }

    /// One past the largest valid pixel id.
    #[must_use]
    pub fn max_pixel_id(&self) -> u32 {
        // bounded by the overflow check in `build`
        #[allow(clippy::cast_possible_truncation)]
        let max = (u64::from(self.first_pixel_id) + self.num_pixels() as u64) as u32;
        max
    }

    /// First pixel id of a grid.
    #[must_use]
    pub fn first_id_of(&self, detector_id: u32) -> Option<u32> {
        self.grids
            .iter()
            .position(|g| g.id == detector_id)
            .map(|i| self.grid_starts[i])
    }

    /// Locates a pixel id; `None` for ids outside every grid.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn pixel(&self, pixel_id: u32) -> Option<PixelLocation> {
        if pixel_id < self.first_pixel_id {
            return None;
        }
        let slot = self.grid_starts.partition_point(|&start| start <= pixel_id);
        let index = slot.checked_sub(1)?;
        let grid = &self.grids[index];
        let offset = (pixel_id - self.grid_starts[index]) as usize;
        if offset >= grid.num_pixels() {
            return None;
        }
        let (row, col) = grid.row_col(offset);
        Some(PixelLocation {
            detector_id: grid.id,
            row,
            col,
            position: grid.position(row as f64, col as f64),
        })
    }

    /// Pixel id of a (row, col) on a grid, both 1-based.
    #[must_use]
    pub fn pixel_id(&self, detector_id: u32, row: usize, col: usize) -> Option<u32> {
        let index = self.grids.iter().position(|g| g.id == detector_id)?;
        let grid = &self.grids[index];
        if row == 0 || col == 0 || row > grid.num_rows || col > grid.num_cols {
            return None;
        }
        let offset = u32::try_from((col - 1) * grid.num_rows + (row - 1)).ok()?;
        Some(self.grid_starts[index] + offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_grids() -> InstrumentCalibration {
        let a = DetectorGrid::new(3, 2, 3, 0.3, 0.2, Vec3::Z * 0.4, Vec3::Y, Vec3::X).unwrap();
        let b = DetectorGrid::new(9, 4, 4, 0.4, 0.4, -Vec3::Z * 0.4, Vec3::Y, Vec3::X).unwrap();
        InstrumentCalibration::new(Instrument::Topaz, 18.0, 0.0, vec![a, b]).unwrap()
    }

    #[test]
    fn test_pixel_id_layout() {
        let cal = two_grids();
        assert_eq!(cal.num_pixels(), 22);
        assert_eq!(cal.max_pixel_id(), 23);
        assert_eq!(cal.first_id_of(9), Some(7));

        let first = cal.pixel(1).unwrap();
        assert_eq!((first.detector_id, first.row, first.col), (3, 1, 1));
        let second = cal.pixel(2).unwrap();
        assert_eq!((second.row, second.col), (2, 1));
        let next_grid = cal.pixel(7).unwrap();
        assert_eq!((next_grid.detector_id, next_grid.row, next_grid.col), (9, 1, 1));
        assert!(cal.pixel(0).is_none());
        assert!(cal.pixel(23).is_none());
    }

    #[test]
    fn test_pixel_id_inverse() {
        let cal = two_grids();
        for id in 1..cal.max_pixel_id() {
            let loc = cal.pixel(id).unwrap();
            assert_eq!(cal.pixel_id(loc.detector_id, loc.row, loc.col), Some(id));
        }
        assert_eq!(cal.pixel_id(3, 3, 1), None);
        assert_eq!(cal.pixel_id(42, 1, 1), None);
    }

    #[test]
    fn test_duplicate_grid_rejected() {
        let a = DetectorGrid::new(3, 2, 2, 0.1, 0.1, Vec3::Z, Vec3::Y, Vec3::X).unwrap();
        let result = InstrumentCalibration::new(Instrument::Snap, 15.0, 0.0, vec![a.clone(), a]);
        assert!(matches!(result, Err(Error::InvalidCalibration(_))));
    }

    #[test]
    fn test_bad_l1_rejected() {
        let a = DetectorGrid::new(3, 2, 2, 0.1, 0.1, Vec3::Z, Vec3::Y, Vec3::X).unwrap();
        assert!(InstrumentCalibration::new(Instrument::Snap, 0.0, 0.0, vec![a]).is_err());
        assert!(InstrumentCalibration::new(Instrument::Snap, 15.0, 0.0, vec![]).is_err());
    }
}
