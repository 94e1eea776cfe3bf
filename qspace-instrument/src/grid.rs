//! Flat rectangular detector grids.

use qspace_core::Vec3;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A flat detector panel with uniformly spaced pixels.
///
/// Rows and columns are numbered from 1 starting in the lower-left corner.
/// Columns run along `base`, rows along `up`; positions are in meters
/// relative to the sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorGrid {
    pub id: u32,
    pub num_rows: usize,
    pub num_cols: usize,
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub depth: f64,
    pub center: Vec3,
    pub base: Vec3,
    pub up: Vec3,
}

impl DetectorGrid {
    /// Validates and normalizes a grid.
    ///
    /// # Errors
    /// Returns an error for an empty or zero-sized grid, or if `base` and
    /// `up` are zero or parallel.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u32,
        num_rows: usize,
        num_cols: usize,
        width: f64,
        height: f64,
        center: Vec3,
        base: Vec3,
        up: Vec3,
    ) -> Result<Self> {
        let grid = Self {
            id,
            num_rows,
            num_cols,
            width,
            height,
            depth: 0.0,
            center,
            base,
            up,
        };
        grid.validated()
    }

    pub(crate) fn validated(mut self) -> Result<Self> {
        if self.num_rows == 0 || self.num_cols == 0 {
            return Err(Error::InvalidCalibration(format!(
                "detector {} has no pixels",
                self.id
            )));
        }
        if !(self.width > 0.0 && self.height > 0.0) {
            return Err(Error::InvalidCalibration(format!(
                "detector {} has non-positive size {}x{}",
                self.id, self.width, self.height
            )));
        }
        let base = self.base.normalized();
        let up = self.up.normalized();
        match (base, up) {
            (Some(base), Some(up)) if base.cross(up).length() > 1e-6 => {
                self.base = base;
                self.up = up;
                Ok(self)
            }
            _ => Err(Error::InvalidCalibration(format!(
                "detector {} has degenerate base/up vectors",
                self.id
            ))),
        }
    }

    #[must_use]
    pub fn num_pixels(&self) -> usize {
        self.num_rows * self.num_cols
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn pixel_width(&self) -> f64 {
        self.width / self.num_cols as f64
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn pixel_height(&self) -> f64 {
        self.height / self.num_rows as f64
    }

    /// Position of a (possibly fractional) row/column.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn position(&self, row: f64, col: f64) -> Vec3 {
        let dx = self.pixel_width();
        let dy = self.pixel_height();
        let x = (col - 1.0) * dx - dx * (self.num_cols as f64 - 1.0) / 2.0;
        let y = (row - 1.0) * dy - dy * (self.num_rows as f64 - 1.0) / 2.0;
        self.center + self.base * x + self.up * y
    }

    /// Row and column (1-based) of the `index`-th pixel, column-major.
    #[must_use]
    pub fn row_col(&self, index: usize) -> (usize, usize) {
        (index % self.num_rows + 1, index / self.num_rows + 1)
    }
}
