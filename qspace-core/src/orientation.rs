//! Crystal orientation (UB) matrix.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::geometry::{Mat3, Vec3};
use crate::peak::MillerIndex;
use crate::Result;

/// A validated UB matrix and its inverse.
///
/// `UB * hkl = Q / 2π`. Construction fails for a non-invertible matrix, so
/// an existing `OrientationMatrix` always has a usable inverse. The value
/// is immutable; re-indexing produces a new one.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OrientationMatrix {
    ub: Mat3,
    ub_inverse: Mat3,
}

impl OrientationMatrix {
    /// Validates and wraps a UB matrix.
    ///
    /// # Errors
    /// Returns [`crate::Error::SingularMatrix`] if `ub` does not invert.
    pub fn new(ub: Mat3) -> Result<Self> {
        let ub_inverse = ub.inverse()?;
        Ok(Self { ub, ub_inverse })
    }

    /// Builds from the transposed form stored by ISAW/SNS tools.
    ///
    /// # Errors
    /// Returns an error if the matrix does not invert.
    pub fn from_transposed(ub_transposed: Mat3) -> Result<Self> {
        Self::new(ub_transposed.transpose())
    }

    #[must_use]
    pub fn ub(&self) -> &Mat3 {
        &self.ub
    }

    #[must_use]
    pub fn ub_inverse(&self) -> &Mat3 {
        &self.ub_inverse
    }

    /// Fractional Miller indices of a Q/2π vector.
    #[must_use]
    pub fn hkl_of(&self, q: Vec3) -> Vec3 {
        self.ub_inverse * q
    }

    /// Q/2π of integer Miller indices.
    #[must_use]
    pub fn q_of(&self, hkl: MillerIndex) -> Vec3 {
        self.ub * hkl.to_vec()
    }

    /// UB scaled by 2π; its columns are the h, k, l basis vectors in the
    /// units of histogram Q.
    #[must_use]
    pub fn lattice_basis(&self) -> Mat3 {
        self.ub.scaled(std::f64::consts::TAU)
    }
}
