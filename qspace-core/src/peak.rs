//! Peak data types.
//!
//! A single [`Peak`] type covers every stage of a peak's life: found on a
//! histogram page, indexed against an orientation matrix (gains `hkl`),
//! integrated (gains an [`IntensityEstimate`]). Peaks are never deleted;
//! rejected peaks are marked invalid.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::geometry::Vec3;

/// Integer Miller indices of a reciprocal-lattice point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MillerIndex {
    pub h: i32,
    pub k: i32,
    pub l: i32,
}

impl MillerIndex {
    #[must_use]
    pub const fn new(h: i32, k: i32, l: i32) -> Self {
        Self { h, k, l }
    }

    /// Rounds fractional indices to the nearest lattice point.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn round(fractional: Vec3) -> Self {
        Self::new(
            fractional.x.round() as i32,
            fractional.y.round() as i32,
            fractional.z.round() as i32,
        )
    }

    /// True for `(0, 0, 0)`, which never identifies a peak.
    #[must_use]
    pub fn is_origin(&self) -> bool {
        self.h == 0 && self.k == 0 && self.l == 0
    }

    #[must_use]
    pub fn to_vec(self) -> Vec3 {
        Vec3::new(f64::from(self.h), f64::from(self.k), f64::from(self.l))
    }
}

impl std::fmt::Display for MillerIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{},{}", self.h, self.k, self.l)
    }
}

/// Net intensity and its standard deviation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IntensityEstimate {
    pub intensity: f64,
    pub sigma: f64,
}

impl IntensityEstimate {
    /// `I / sigma`, or 0 when sigma is zero.
    #[must_use]
    pub fn i_over_sigma(&self) -> f64 {
        if self.sigma > 0.0 {
            self.intensity / self.sigma
        } else {
            0.0
        }
    }
}

/// Run and sample-orientation metadata shared by a group of peaks.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RunInfo {
    pub run: u32,
    pub chi: f64,
    pub phi: f64,
    pub omega: f64,
    pub monitor_count: f64,
}

/// A diffraction peak.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Peak {
    /// Sequence number within a peak list (1-based).
    pub seqn: u32,
    /// Detector (grid) id the peak was observed on; 0 if unknown.
    pub detector_id: u32,
    /// Fractional detector row.
    pub row: f64,
    /// Fractional detector column.
    pub col: f64,
    /// Fractional time channel (0-based).
    pub channel: f64,
    /// Q vector divided by 2π.
    pub q: Vec3,
    /// Time-of-flight in microseconds, if known.
    pub tof: f64,
    /// Wavelength in Angstroms, if known.
    pub wavelength: f64,
    /// Counts in the peak channel.
    pub ipk: f64,
    /// Refinement / integration flag in the ISAW convention.
    pub reflag: i32,
    pub run_info: RunInfo,
    /// Miller indices; present only after indexing.
    pub hkl: Option<MillerIndex>,
    /// Intensity estimate; present only after integration.
    pub intensity: Option<IntensityEstimate>,
    valid: bool,
}

impl Default for Peak {
    fn default() -> Self {
        Self {
            seqn: 0,
            detector_id: 0,
            row: 0.0,
            col: 0.0,
            channel: 0.0,
            q: Vec3::default(),
            tof: 0.0,
            wavelength: 0.0,
            ipk: 0.0,
            reflag: 0,
            run_info: RunInfo::default(),
            hkl: None,
            intensity: None,
            valid: true,
        }
    }
}

impl Peak {
    /// Creates a valid, unindexed peak at a Q position (Q/2π).
    #[must_use]
    pub fn at_q(q: Vec3) -> Self {
        Self {
            q,
            ..Self::default()
        }
    }

    /// Creates a valid peak at a detector position.
    #[must_use]
    pub fn on_detector(detector_id: u32, row: f64, col: f64, channel: f64) -> Self {
        Self {
            detector_id,
            row,
            col,
            channel,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_indexed(&self) -> bool {
        self.hkl.is_some_and(|hkl| !hkl.is_origin())
    }

    #[must_use]
    pub fn is_integrated(&self) -> bool {
        self.intensity.is_some()
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Marks the peak invalid. There is no way back.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Q including the factor of 2π, as stored in histograms.
    #[must_use]
    pub fn q_2pi(&self) -> Vec3 {
        self.q * std::f64::consts::TAU
    }

    /// d-spacing in Angstroms, or 0 at the origin.
    #[must_use]
    pub fn d_spacing(&self) -> f64 {
        let len = self.q.length();
        if len > 0.0 {
            1.0 / len
        } else {
            0.0
        }
    }

    /// Records an integration result.
    pub fn set_intensity(&mut self, intensity: f64, sigma: f64) {
        self.intensity = Some(IntensityEstimate { intensity, sigma });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_predicates() {
        let mut peak = Peak::at_q(Vec3::new(0.5, 0.0, 0.0));
        assert!(!peak.is_indexed());
        assert!(!peak.is_integrated());
        assert!(peak.is_valid());

        peak.hkl = Some(MillerIndex::new(0, 0, 0));
        assert!(!peak.is_indexed());
        peak.hkl = Some(MillerIndex::new(1, 0, -2));
        assert!(peak.is_indexed());

        peak.set_intensity(100.0, 10.0);
        assert!(peak.is_integrated());
        assert_relative_eq!(peak.intensity.unwrap().i_over_sigma(), 10.0);

        peak.invalidate();
        assert!(!peak.is_valid());
        assert_relative_eq!(peak.d_spacing(), 2.0);
    }

    #[test]
    fn test_miller_round() {
        let hkl = MillerIndex::round(Vec3::new(1.4, -2.6, 0.49));
        assert_eq!(hkl, MillerIndex::new(1, -3, 0));
        assert_eq!(hkl.to_string(), "1,-3,0");
    }
}
