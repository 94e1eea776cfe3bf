//! One-dimensional binners.
//!
//! Bins are half-open: a coordinate `x` belongs to bin `i` when
//! `min + i*step <= x < min + (i+1)*step`. A value exactly on the upper
//! edge `max` is out of range. Every histogram helper uses this convention.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::geometry::Vec3;
use crate::{Error, Result};

/// Uniform binning of the interval `[min, max)` into `num_bins` bins.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UniformBinner {
    min: f64,
    max: f64,
    num_bins: usize,
    step: f64,
}

impl UniformBinner {
    /// Creates a binner over `[min, max)`.
    ///
    /// # Errors
    /// Returns an error if `num_bins == 0`, `max <= min` or a bound is not finite.
    #[allow(clippy::cast_precision_loss)]
    pub fn new(min: f64, max: f64, num_bins: usize) -> Result<Self> {
        if num_bins == 0 || !min.is_finite() || !max.is_finite() || max <= min {
            return Err(Error::InvalidBinner {
                min,
                max,
                bins: num_bins,
            });
        }
        Ok(Self {
            min,
            max,
            num_bins,
            step: (max - min) / num_bins as f64,
        })
    }

    #[must_use]
    pub fn min(&self) -> f64 {
        self.min
    }

    #[must_use]
    pub fn max(&self) -> f64 {
        self.max
    }

    #[must_use]
    pub fn num_bins(&self) -> usize {
        self.num_bins
    }

    #[must_use]
    pub fn step(&self) -> f64 {
        self.step
    }

    /// Bin index containing `x`, or `None` if `x` is outside `[min, max)`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn index(&self, x: f64) -> Option<usize> {
        if !(x >= self.min && x < self.max) {
            return None;
        }
        let index = ((x - self.min) / self.step).floor() as usize;
        // Rounding can push values just below max into a nonexistent bin.
        Some(index.min(self.num_bins - 1))
    }

    /// Unclamped (possibly negative or too large) fractional index of `x`.
    #[must_use]
    pub fn fractional_index(&self, x: f64) -> f64 {
        (x - self.min) / self.step
    }

    /// Coordinate of the centre of bin `index`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn center(&self, index: usize) -> f64 {
        self.min + (index as f64 + 0.5) * self.step
    }

    /// Lower edge of bin `index`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn edge(&self, index: usize) -> f64 {
        self.min + index as f64 * self.step
    }

    /// Returns a binner with both bounds multiplied by `scale`.
    ///
    /// # Errors
    /// Returns an error if `scale` is not positive.
    pub fn scaled(&self, scale: f64) -> Result<Self> {
        Self::new(self.min * scale, self.max * scale, self.num_bins)
    }
}

/// Bins the projection of a point onto a fixed direction.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProjectionBinner {
    direction: Vec3,
    binner: UniformBinner,
}

impl ProjectionBinner {
    /// Creates a projection binner; `direction` is normalized.
    ///
    /// # Errors
    /// Returns an error if `direction` is the zero vector.
    pub fn new(direction: Vec3, binner: UniformBinner) -> Result<Self> {
        let direction = direction
            .normalized()
            .ok_or_else(|| Error::ConfigError("zero-length binner direction".to_string()))?;
        Ok(Self { direction, binner })
    }

    /// Convenience constructor over `[min, max)` along `direction`.
    ///
    /// # Errors
    /// Returns an error if the direction or range is invalid.
    pub fn along(direction: Vec3, min: f64, max: f64, num_bins: usize) -> Result<Self> {
        Self::new(direction, UniformBinner::new(min, max, num_bins)?)
    }

    #[must_use]
    pub fn direction(&self) -> Vec3 {
        self.direction
    }

    #[must_use]
    pub fn binner(&self) -> &UniformBinner {
        &self.binner
    }

    #[must_use]
    pub fn num_bins(&self) -> usize {
        self.binner.num_bins()
    }

    #[must_use]
    pub fn step(&self) -> f64 {
        self.binner.step()
    }

    /// Bin index of the projection of `point`, if in range.
    #[must_use]
    pub fn index(&self, point: Vec3) -> Option<usize> {
        self.binner.index(point.dot(self.direction))
    }

    /// Bin centre as a vector along the binner direction.
    #[must_use]
    pub fn center_vec(&self, index: usize) -> Vec3 {
        self.direction * self.binner.center(index)
    }
}
