//! Lattice-aligned quick integration.
//!
//! Events are binned on a grid whose axes follow the reciprocal lattice
//! vectors, with `steps_per_miller_index` cells between neighbouring
//! lattice points so every lattice point sits on a cell centre. The cell
//! at a lattice point is the raw signal and its 26 neighbours one sub-step
//! away estimate the background.

use qspace_core::{
    get_i_and_sig_i, Histogram3D, IntensityEstimate, MillerIndex, OrientationMatrix,
    ProjectionBinner, QEventBatch, Vec3,
};
use rayon::prelude::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const DEFAULT_STEPS_PER_MILLER_INDEX: usize = 5;
/// Largest accepted `max_q` (1/Å, including 2π).
pub const MAX_Q_ALLOWED: f64 = 40.0;
/// Smallest accepted `max_q`.
pub const MIN_Q_ALLOWED: f64 = 0.5;
/// Default I/σ reporting levels.
pub const DEFAULT_LEVELS: [f64; 5] = [0.0, 2.0, 3.0, 5.0, 10.0];

/// Quick integration parameters.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct QuickIntegrateConfig {
    pub steps_per_miller_index: usize,
    /// Half width of the grid along each lattice direction, clamped to
    /// `[MIN_Q_ALLOWED, MAX_Q_ALLOWED]`.
    pub max_q: f64,
    /// Largest `|h|`, `|k|`, `|l|` visited.
    pub max_index: i32,
    /// I/σ levels counted in the results.
    pub levels: Vec<f64>,
}

impl Default for QuickIntegrateConfig {
    fn default() -> Self {
        Self {
            steps_per_miller_index: DEFAULT_STEPS_PER_MILLER_INDEX,
            max_q: 20.0,
            max_index: 20,
            levels: DEFAULT_LEVELS.to_vec(),
        }
    }
}

impl QuickIntegrateConfig {
    #[must_use]
    pub fn with_steps_per_miller_index(mut self, steps: usize) -> Self {
        self.steps_per_miller_index = steps;
        self
    }

    #[must_use]
    pub fn with_max_q(mut self, max_q: f64) -> Self {
        self.max_q = max_q;
        self
    }

    #[must_use]
    pub fn with_max_index(mut self, max_index: i32) -> Self {
        self.max_index = max_index;
        self
    }

    #[must_use]
    pub fn with_levels(mut self, levels: Vec<f64>) -> Self {
        self.levels = levels;
        self
    }
}

/// One lattice point with signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuickPeak {
    pub hkl: MillerIndex,
    /// Q / 2π of the lattice point.
    pub q: Vec3,
    pub intensity: IntensityEstimate,
}

/// Outcome of one quick integration pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuickIntegrateResults {
    pub peaks: Vec<QuickPeak>,
    pub levels: Vec<f64>,
    /// `level_counts[i]` is the number of peaks with `I/σ >= levels[i]`.
    pub level_counts: Vec<usize>,
}

impl QuickIntegrateResults {
    /// Peaks at or above an I/σ level.
    pub fn above(&self, level: f64) -> impl Iterator<Item = &QuickPeak> {
        self.peaks
            .iter()
            .filter(move |p| p.intensity.i_over_sigma() >= level)
    }
}

/// Accumulates events on a lattice-aligned grid and integrates every
/// lattice point.
#[derive(Debug, Clone)]
pub struct QuickIntegrator {
    orientation: OrientationMatrix,
    config: QuickIntegrateConfig,
    histogram: Histogram3D,
}

impl QuickIntegrator {
    /// Builds the lattice grid for an orientation.
    ///
    /// # Errors
    /// [`Error::InvalidConfig`] for zero steps per index, or a core error
    /// when the lattice vectors cannot span a grid.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn new(orientation: OrientationMatrix, config: QuickIntegrateConfig) -> Result<Self> {
        if config.steps_per_miller_index == 0 {
            return Err(Error::InvalidConfig(
                "steps per Miller index must be positive".to_string(),
            ));
        }
        let max_q = config.max_q.clamp(MIN_Q_ALLOWED, MAX_Q_ALLOWED);
        let steps = config.steps_per_miller_index as f64;
        let basis = orientation.lattice_basis();

        let mut edges = Vec::with_capacity(3);
        for axis in 0..3 {
            let vector = basis.column(axis);
            let one_step = vector.length() / steps;
            let max_index = (max_q / one_step).round().max(0.0);
            let max_dist = (max_index + 0.5) * one_step;
            let num_bins = 2 * (max_index as usize) + 1;
            edges.push(ProjectionBinner::along(vector, -max_dist, max_dist, num_bins)?);
        }
        let histogram = Histogram3D::new(edges[0], edges[1], edges[2])?;
        log::debug!(
            "quick integrate grid {:?} for max |Q| {max_q}",
            histogram.num_bins()
        );
        Ok(Self {
            orientation,
            config,
            histogram,
        })
    }

    #[must_use]
    pub fn orientation(&self) -> &OrientationMatrix {
        &self.orientation
    }

    #[must_use]
    pub fn config(&self) -> &QuickIntegrateConfig {
        &self.config
    }

    #[must_use]
    pub fn histogram(&self) -> &Histogram3D {
        &self.histogram
    }

    /// Adds events unweighted; returns how many landed on the grid.
    pub fn add_events(&mut self, events: &QEventBatch) -> usize {
        self.histogram.add_events(events, false)
    }

    pub fn clear(&mut self) {
        self.histogram.clear();
    }

    /// Integrates every lattice point with a positive centre cell.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn integrate(&self) -> QuickIntegrateResults {
        let basis = self.orientation.lattice_basis();
        let sub_step = 1.0 / self.config.steps_per_miller_index as f64;
        let n = self.config.max_index.max(0);

        let offsets: Vec<Vec3> = neighbour_offsets()
            .map(|d| basis * (d * sub_step))
            .collect();
        let histogram = &self.histogram;

        let peaks: Vec<QuickPeak> = (-n..=n)
            .into_par_iter()
            .flat_map_iter(|h| {
                let offsets = &offsets;
                (-n..=n).flat_map(move |k| {
                    (-n..=n).filter_map(move |l| {
                        let hkl = MillerIndex::new(h, k, l);
                        if hkl.is_origin() {
                            return None;
                        }
                        let center = basis * hkl.to_vec();
                        let raw = histogram.value_at(center);
                        if raw <= 0.0 {
                            return None;
                        }
                        let around: f64 = offsets
                            .iter()
                            .map(|&d| histogram.value_at(center + d))
                            .sum();
                        Some(QuickPeak {
                            hkl,
                            q: self.orientation.q_of(hkl),
                            intensity: get_i_and_sig_i(raw, 1.0, around, 26.0),
                        })
                    })
                })
            })
            .collect();

        let level_counts = self
            .config
            .levels
            .iter()
            .map(|&level| {
                peaks
                    .iter()
                    .filter(|p| p.intensity.i_over_sigma() >= level)
                    .count()
            })
            .collect();
        log::debug!("quick integrate: {} lattice points with signal", peaks.len());

        QuickIntegrateResults {
            peaks,
            levels: self.config.levels.clone(),
            level_counts,
        }
    }
}

/// The 26 unit offsets of a 3x3x3 neighbourhood.
fn neighbour_offsets() -> impl Iterator<Item = Vec3> {
    (-1..=1).flat_map(|i| {
        (-1..=1).flat_map(move |j| {
            (-1..=1)
                .filter(move |&k| (i, j, k) != (0, 0, 0))
                .map(move |k| Vec3::new(f64::from(i), f64::from(j), f64::from(k)))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use qspace_core::Mat3;

    fn cubic(a: f64) -> OrientationMatrix {
        OrientationMatrix::new(Mat3::identity().scaled(1.0 / a)).unwrap()
    }

    #[test]
    fn test_offsets() {
        let offsets: Vec<Vec3> = neighbour_offsets().collect();
        assert_eq!(offsets.len(), 26);
        assert!(offsets.iter().all(|d| d.length() > 0.0));
    }

    #[test]
    fn test_grid_geometry() {
        let integrator = QuickIntegrator::new(cubic(5.0), QuickIntegrateConfig::default()).unwrap();
        // one step = 2π/5/5, max_index = round(20 / one_step) = 80
        assert_eq!(integrator.histogram().num_bins(), [161, 161, 161]);
    }

    #[test]
    fn test_point_on_lattice() {
        let orientation = cubic(5.0);
        let config = QuickIntegrateConfig::default().with_max_q(5.0).with_max_index(3);
        let mut integrator = QuickIntegrator::new(orientation, config).unwrap();

        let center = orientation.q_of(MillerIndex::new(1, 2, 0)) * std::f64::consts::TAU;
        let mut events = QEventBatch::default();
        for _ in 0..20 {
            events.push(center);
        }
        let step = std::f64::consts::TAU / 5.0 / 5.0;
        for _ in 0..26 {
            events.push(center + Vec3::new(step, 0.0, 0.0));
        }
        assert_eq!(integrator.add_events(&events), 46);

        let results = integrator.integrate();
        assert_eq!(results.peaks.len(), 1);
        let peak = results.peaks[0];
        assert_eq!(peak.hkl, MillerIndex::new(1, 2, 0));
        assert_relative_eq!(peak.intensity.intensity, 19.0);
        assert_relative_eq!(peak.intensity.sigma, (20.0 + 26.0 / 676.0_f64).sqrt());
        assert_eq!(results.level_counts, vec![1, 1, 1, 0, 0]);
        assert_eq!(results.above(3.0).count(), 1);
    }

    #[test]
    fn test_zero_steps_rejected() {
        let config = QuickIntegrateConfig::default().with_steps_per_miller_index(0);
        assert!(matches!(
            QuickIntegrator::new(cubic(4.0), config),
            Err(Error::InvalidConfig(_))
        ));
    }
}
