//! Three-dimensional histogram over reciprocal space.
//!
//! The grid is spanned by three [`ProjectionBinner`]s whose directions need
//! not be orthogonal. A cell `(x, y, z)` holds every point
//! `u*ex + v*ey + w*ez` with `u`, `v`, `w` inside the corresponding edge
//! bins. Points are placed with dual binners (directions orthogonal to the
//! other two edges) so skewed grids, e.g. grids aligned with a reciprocal
//! lattice, are binned exactly.
//!
//! # Memory Layout
//!
//! Counts are stored in an `Array3<f64>` indexed `[z][y][x]`, so a page
//! (fixed `z`) is a contiguous 2D slice.

use ndarray::{Array2, Array3, ArrayView3, Axis};
use rayon::prelude::*;

use crate::binner::ProjectionBinner;
use crate::event::QEventBatch;
use crate::geometry::{Mat3, Vec3, SINGULAR_TOLERANCE};
use crate::{Error, Result};

/// Batches at least this large are located and accumulated in parallel.
const PARALLEL_LOCATE_MIN: usize = 50_000;

/// Tolerance used when deciding whether edge directions are orthogonal.
const ORTHOGONAL_TOLERANCE: f64 = 1e-10;

/// Result of [`Histogram3D::sphere_integrals`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SphereIntegrals {
    /// Cumulative count inside each radius.
    pub counts: Vec<f64>,
    /// Number of cells whose centre lies inside each radius.
    pub n_bins: Vec<usize>,
    /// `n_bins * cell_volume` for each radius.
    pub volumes: Vec<f64>,
}

/// A regular 3D grid accumulating weighted event counts.
#[derive(Debug, Clone)]
pub struct Histogram3D {
    x_edge: ProjectionBinner,
    y_edge: ProjectionBinner,
    z_edge: ProjectionBinner,
    x_dual: ProjectionBinner,
    y_dual: ProjectionBinner,
    z_dual: ProjectionBinner,
    cells: Array3<f64>,
    total: f64,
    num_added: u64,
}

impl Histogram3D {
    /// Creates an empty histogram from three edge binners.
    ///
    /// # Errors
    /// Returns [`Error::DegenerateAxes`] if the edge directions are coplanar.
    pub fn new(
        x_edge: ProjectionBinner,
        y_edge: ProjectionBinner,
        z_edge: ProjectionBinner,
    ) -> Result<Self> {
        let (ex, ey, ez) = (x_edge.direction(), y_edge.direction(), z_edge.direction());
        let det = Mat3::from_columns(ex, ey, ez).determinant();
        if det.abs() < SINGULAR_TOLERANCE {
            return Err(Error::DegenerateAxes);
        }

        let orthogonal = ex.dot(ey).abs() < ORTHOGONAL_TOLERANCE
            && ey.dot(ez).abs() < ORTHOGONAL_TOLERANCE
            && ez.dot(ex).abs() < ORTHOGONAL_TOLERANCE;

        let (x_dual, y_dual, z_dual) = if orthogonal {
            (x_edge, y_edge, z_edge)
        } else {
            (
                dual_binner(&x_edge, ey.cross(ez))?,
                dual_binner(&y_edge, ez.cross(ex))?,
                dual_binner(&z_edge, ex.cross(ey))?,
            )
        };

        let cells = Array3::zeros((z_edge.num_bins(), y_edge.num_bins(), x_edge.num_bins()));
        Ok(Self {
            x_edge,
            y_edge,
            z_edge,
            x_dual,
            y_dual,
            z_dual,
            cells,
            total: 0.0,
            num_added: 0,
        })
    }

    /// Axis-aligned cube `[-max_q, max_q)^3` with `num_bins` bins per axis.
    ///
    /// # Errors
    /// Returns an error if `max_q <= 0` or `num_bins == 0`.
    pub fn cube(max_q: f64, num_bins: usize) -> Result<Self> {
        Self::new(
            ProjectionBinner::along(Vec3::X, -max_q, max_q, num_bins)?,
            ProjectionBinner::along(Vec3::Y, -max_q, max_q, num_bins)?,
            ProjectionBinner::along(Vec3::Z, -max_q, max_q, num_bins)?,
        )
    }

    /// Returns an empty histogram with the same geometry.
    #[must_use]
    pub fn empty_like(&self) -> Self {
        Self {
            x_edge: self.x_edge,
            y_edge: self.y_edge,
            z_edge: self.z_edge,
            x_dual: self.x_dual,
            y_dual: self.y_dual,
            z_dual: self.z_dual,
            cells: Array3::zeros(self.cells.raw_dim()),
            total: 0.0,
            num_added: 0,
        }
    }

    /// Edge binners in `(x, y, z)` order.
    #[must_use]
    pub fn edges(&self) -> [&ProjectionBinner; 3] {
        [&self.x_edge, &self.y_edge, &self.z_edge]
    }

    /// Number of bins along `(x, y, z)`.
    #[must_use]
    pub fn num_bins(&self) -> [usize; 3] {
        [
            self.x_edge.num_bins(),
            self.y_edge.num_bins(),
            self.z_edge.num_bins(),
        ]
    }

    /// Volume of a single cell in Q-space units.
    #[must_use]
    pub fn cell_volume(&self) -> f64 {
        let a = self.x_edge.direction() * self.x_edge.step();
        let b = self.y_edge.direction() * self.y_edge.step();
        let c = self.z_edge.direction() * self.z_edge.step();
        Mat3::from_columns(a, b, c).determinant().abs()
    }

    /// Cell indices `[x, y, z]` containing `point`, if inside the histogram.
    #[must_use]
    pub fn locate(&self, point: Vec3) -> Option<[usize; 3]> {
        Some([
            self.x_dual.index(point)?,
            self.y_dual.index(point)?,
            self.z_dual.index(point)?,
        ])
    }

    /// Centre of cell `(x, y, z)` in Q-space.
    #[must_use]
    pub fn bin_center(&self, x: usize, y: usize, z: usize) -> Vec3 {
        self.x_edge.center_vec(x) + self.y_edge.center_vec(y) + self.z_edge.center_vec(z)
    }

    /// Position for fractional cell coordinates, where integer values are
    /// lower cell edges and `x + 0.5` is a cell centre.
    #[must_use]
    pub fn position_at(&self, x: f64, y: f64, z: f64) -> Vec3 {
        let along = |edge: &ProjectionBinner, f: f64| {
            edge.direction() * (edge.binner().min() + f * edge.step())
        };
        along(&self.x_edge, x) + along(&self.y_edge, y) + along(&self.z_edge, z)
    }

    /// Accumulates a batch of events.
    ///
    /// Each event in range adds its weight (or 1 when `use_weights` is false)
    /// to the containing cell; events outside any axis range are dropped.
    /// Large batches are accumulated page-parallel: events are grouped by z
    /// page and every rayon task owns one page, so cell sums are the same
    /// as a serial pass. Returns the number of events accumulated.
    pub fn add_events(&mut self, batch: &QEventBatch, use_weights: bool) -> usize {
        let parallel = batch.len() >= PARALLEL_LOCATE_MIN;
        let located: Vec<Option<[usize; 3]>> = if parallel {
            (0..batch.len())
                .into_par_iter()
                .map(|i| self.locate(batch.q(i)))
                .collect()
        } else {
            (0..batch.len()).map(|i| self.locate(batch.q(i))).collect()
        };

        let mut pages: Vec<Vec<(usize, usize, f64)>> = vec![Vec::new(); self.cells.dim().0];
        let mut added = 0usize;
        for (i, cell) in located.into_iter().enumerate() {
            if let Some([x, y, z]) = cell {
                let weight = if use_weights { batch.weight[i] } else { 1.0 };
                pages[z].push((y, x, weight));
                self.total += weight;
                added += 1;
            }
        }

        let fill = |(mut page, events): (ndarray::ArrayViewMut2<f64>, &Vec<(usize, usize, f64)>)| {
            for &(y, x, weight) in events {
                page[[y, x]] += weight;
            }
        };
        let page_views: Vec<_> = self.cells.outer_iter_mut().collect();
        if parallel {
            page_views.into_par_iter().zip(pages.par_iter()).for_each(fill);
        } else {
            page_views.into_iter().zip(pages.iter()).for_each(fill);
        }
        self.num_added += added as u64;
        added
    }

    /// Resets every cell to zero; geometry is unchanged.
    pub fn clear(&mut self) {
        self.cells.fill(0.0);
        self.total = 0.0;
        self.num_added = 0;
    }

    /// Count of the cell containing `point`, or 0 if out of range.
    #[must_use]
    pub fn value_at(&self, point: Vec3) -> f64 {
        self.locate(point)
            .map_or(0.0, |[x, y, z]| self.cells[[z, y, x]])
    }

    /// Count of cell `(x, y, z)`, or 0 if out of range.
    #[must_use]
    pub fn cell(&self, x: usize, y: usize, z: usize) -> f64 {
        self.cells.get([z, y, x]).copied().unwrap_or(0.0)
    }

    /// Read-only view of all cells, indexed `[z][y][x]`.
    #[must_use]
    pub fn cells(&self) -> ArrayView3<'_, f64> {
        self.cells.view()
    }

    /// Sum of all accumulated weights.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.total
    }

    /// Number of events accumulated since the last clear.
    #[must_use]
    pub fn num_added(&self) -> u64 {
        self.num_added
    }

    /// Smallest and largest cell values.
    #[must_use]
    pub fn min_max(&self) -> (f64, f64) {
        self.cells
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            })
    }

    /// Copy of page `z` as a `[y][x]` array.
    ///
    /// # Errors
    /// Returns [`Error::OutOfRange`] if `page >= num_bins()[2]`.
    pub fn page_slice(&self, page: usize) -> Result<Array2<f64>> {
        if page >= self.z_edge.num_bins() {
            return Err(Error::OutOfRange {
                what: "page",
                value: page.to_string(),
            });
        }
        Ok(self.cells.index_axis(Axis(0), page).to_owned())
    }

    /// Cumulative sums over spheres of increasing radius.
    ///
    /// A cell is inside radius `r` when the distance from its centre to
    /// `center` is `<= r`. Radii must be ascending.
    ///
    /// # Errors
    /// Returns [`Error::OutOfRange`] if `center` is outside the histogram.
    pub fn sphere_integrals(&self, center: Vec3, radii: &[f64]) -> Result<SphereIntegrals> {
        if self.locate(center).is_none() {
            return Err(Error::OutOfRange {
                what: "sphere center",
                value: format!("{center:?}"),
            });
        }
        let Some(max_radius) = radii.iter().copied().reduce(f64::max) else {
            return Ok(SphereIntegrals::default());
        };

        let radii_sq: Vec<f64> = radii.iter().map(|r| r * r).collect();
        let mut shell_counts = vec![0.0; radii.len()];
        let mut shell_bins = vec![0usize; radii.len()];

        let (x_lo, x_hi) = index_bounds(&self.x_dual, center, max_radius);
        let (y_lo, y_hi) = index_bounds(&self.y_dual, center, max_radius);
        let (z_lo, z_hi) = index_bounds(&self.z_dual, center, max_radius);

        for z in z_lo..=z_hi {
            for y in y_lo..=y_hi {
                for x in x_lo..=x_hi {
                    let d2 = self.bin_center(x, y, z).distance_squared(center);
                    let shell = radii_sq.partition_point(|&r2| r2 < d2);
                    if shell < radii.len() {
                        shell_counts[shell] += self.cells[[z, y, x]];
                        shell_bins[shell] += 1;
                    }
                }
            }
        }

        let cell_volume = self.cell_volume();
        let mut result = SphereIntegrals::default();
        let (mut count, mut bins) = (0.0, 0usize);
        for (c, b) in shell_counts.into_iter().zip(shell_bins) {
            count += c;
            bins += b;
            result.counts.push(count);
            result.n_bins.push(bins);
            #[allow(clippy::cast_precision_loss)]
            result.volumes.push(bins as f64 * cell_volume);
        }
        Ok(result)
    }
}

fn dual_binner(edge: &ProjectionBinner, normal: Vec3) -> Result<ProjectionBinner> {
    let mut direction = normal.normalized().ok_or(Error::DegenerateAxes)?;
    let mut scale = edge.direction().dot(direction);
    if scale < 0.0 {
        direction = -direction;
        scale = -scale;
    }
    ProjectionBinner::new(direction, edge.binner().scaled(scale)?)
}

/// Inclusive index range whose cells may have centres within `radius` of
/// `center` along the binner direction.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn index_bounds(binner: &ProjectionBinner, center: Vec3, radius: f64) -> (usize, usize) {
    let projection = center.dot(binner.direction());
    let last = binner.num_bins() - 1;
    let lo = binner.binner().fractional_index(projection - radius).floor().max(0.0);
    let hi = binner.binner().fractional_index(projection + radius).ceil();
    let hi = if hi < 0.0 { 0 } else { (hi as usize).min(last) };
    ((lo as usize).min(last), hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn batch_of(points: &[[f64; 3]]) -> QEventBatch {
        let mut batch = QEventBatch::default();
        for p in points {
            batch.push(Vec3::from(*p));
        }
        batch
    }

    #[test]
    fn test_add_and_query() {
        let mut hist = Histogram3D::cube(2.0, 4).unwrap();
        let added = hist.add_events(&batch_of(&[[0.1, 0.1, 0.1], [0.2, 0.3, 0.4], [5.0, 0.0, 0.0]]), false);
        assert_eq!(added, 2);
        assert_relative_eq!(hist.value_at(Vec3::new(0.9, 0.9, 0.9)), 2.0);
        assert_relative_eq!(hist.value_at(Vec3::new(-0.5, 0.5, 0.5)), 0.0);
        assert_relative_eq!(hist.total(), 2.0);
        assert_eq!(hist.num_added(), 2);
    }

    #[test]
    fn test_upper_edge_excluded() {
        let mut hist = Histogram3D::cube(1.0, 2).unwrap();
        hist.add_events(&batch_of(&[[1.0, 0.0, 0.0], [-1.0, 0.0, 0.0]]), false);
        assert_relative_eq!(hist.total(), 1.0);
        assert_relative_eq!(hist.cell(0, 1, 1), 1.0);
    }

    #[test]
    fn test_weights() {
        let mut hist = Histogram3D::cube(1.0, 1).unwrap();
        let mut batch = QEventBatch::default();
        batch.push_weighted(Vec3::default(), 2.5);
        hist.add_events(&batch, true);
        hist.add_events(&batch, false);
        assert_relative_eq!(hist.total(), 3.5);
    }

    #[test]
    fn test_page_slice_bounds() {
        let mut hist = Histogram3D::cube(1.0, 2).unwrap();
        hist.add_events(&batch_of(&[[0.5, -0.5, 0.5]]), false);
        let page = hist.page_slice(1).unwrap();
        assert_eq!(page.dim(), (2, 2));
        assert_relative_eq!(page[[0, 1]], 1.0);
        assert!(hist.page_slice(2).is_err());
    }

    #[test]
    fn test_skewed_axes_place_points_exactly() {
        let ex = Vec3::X;
        let ey = Vec3::new(1.0, 1.0, 0.0);
        let ez = Vec3::Z;
        let hist = Histogram3D::new(
            ProjectionBinner::along(ex, 0.0, 4.0, 4).unwrap(),
            ProjectionBinner::along(ey, 0.0, 4.0, 4).unwrap(),
            ProjectionBinner::along(ez, 0.0, 4.0, 4).unwrap(),
        )
        .unwrap();
        // u = 2.5 along ex, v = 1.5 along unit(ey), w = 0.5 along ez
        let p = ex * 2.5 + ey.normalized().unwrap() * 1.5 + ez * 0.5;
        assert_eq!(hist.locate(p), Some([2, 1, 0]));
        let center = hist.bin_center(2, 1, 0);
        assert_eq!(hist.locate(center), Some([2, 1, 0]));
        assert_relative_eq!(hist.cell_volume(), std::f64::consts::FRAC_1_SQRT_2, epsilon = 1e-12);
    }

    #[test]
    fn test_coplanar_axes_rejected() {
        let result = Histogram3D::new(
            ProjectionBinner::along(Vec3::X, 0.0, 1.0, 1).unwrap(),
            ProjectionBinner::along(Vec3::Y, 0.0, 1.0, 1).unwrap(),
            ProjectionBinner::along(Vec3::new(1.0, 1.0, 0.0), 0.0, 1.0, 1).unwrap(),
        );
        assert!(matches!(result, Err(Error::DegenerateAxes)));
    }

    #[test]
    fn test_sphere_integrals_center_out_of_range() {
        let hist = Histogram3D::cube(1.0, 4).unwrap();
        assert!(hist
            .sphere_integrals(Vec3::new(3.0, 0.0, 0.0), &[0.5])
            .is_err());
    }

    #[test]
    fn test_sphere_integrals_single_cell() {
        let mut hist = Histogram3D::cube(2.0, 4).unwrap();
        hist.add_events(&batch_of(&[[0.5, 0.5, 0.5], [0.6, 0.6, 0.6]]), false);
        let result = hist
            .sphere_integrals(Vec3::new(0.5, 0.5, 0.5), &[0.1, 1.0])
            .unwrap();
        assert_eq!(result.n_bins[0], 1);
        assert_relative_eq!(result.counts[0], 2.0);
        // centre plus its 6 face neighbours at distance exactly 1.0
        assert_eq!(result.n_bins[1], 7);
        assert_relative_eq!(result.volumes[1], 7.0);
    }
}
