//! Sphere, slice and cylinder integration of found peaks.

use ndarray::ArrayView2;
use qspace_core::integrate::sphere_volume;
use qspace_core::{get_i_and_sig_i, Histogram3D, IntensityEstimate, Peak, QEventBatch, BACKGROUND_RATIO};
use rayon::prelude::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::partition::{PeakEventList, WindowShape};

/// Added to `reflag` by event sphere integration.
pub const EVENT_SPHERE_REFLAG: i32 = 500;
/// Added to `reflag` by histogram sphere integration.
pub const HISTOGRAM_SPHERE_REFLAG: i32 = 600;

/// Radius scale per page of the seven-page cone integration.
const CONE_SCALES: [f64; 7] = [1.6, 1.4, 1.2, 1.0, 1.2, 1.4, 1.6];

/// Sphere integration parameters. Radii are in histogram Q units
/// (including 2π).
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SphereConfig {
    pub peak_radius: f64,
    pub background_radius: f64,
    /// Inclusive row and column range a peak must lie in; `None` accepts
    /// every position.
    pub detector_window: Option<(f64, f64)>,
    pub use_weights: bool,
}

impl Default for SphereConfig {
    fn default() -> Self {
        let peak_radius = 0.15;
        Self {
            peak_radius,
            background_radius: peak_radius * BACKGROUND_RATIO,
            detector_window: Some((21.0, 236.0)),
            use_weights: false,
        }
    }
}

impl SphereConfig {
    /// Peak radius with a background shell of equal volume.
    #[must_use]
    pub fn with_peak_radius(mut self, radius: f64) -> Self {
        self.peak_radius = radius;
        self.background_radius = radius * BACKGROUND_RATIO;
        self
    }

    #[must_use]
    pub fn with_background_radius(mut self, radius: f64) -> Self {
        self.background_radius = radius;
        self
    }

    #[must_use]
    pub fn with_detector_window(mut self, window: Option<(f64, f64)>) -> Self {
        self.detector_window = window;
        self
    }

    #[must_use]
    pub fn with_weights(mut self, use_weights: bool) -> Self {
        self.use_weights = use_weights;
        self
    }

    fn accepts(&self, peak: &Peak) -> bool {
        if !peak.is_indexed() || !peak.is_valid() {
            return false;
        }
        self.detector_window.map_or(true, |(lo, hi)| {
            (lo..=hi).contains(&peak.row) && (lo..=hi).contains(&peak.col)
        })
    }
}

/// Integrates peaks by counting events inside a sphere and a background
/// shell around each peak.
///
/// Only indexed, valid peaks inside the detector window are touched.
/// Returns the number of peaks integrated.
pub fn integrate_peaks_events(peaks: &mut [Peak], events: &QEventBatch, config: &SphereConfig) -> usize {
    let r2 = config.peak_radius * config.peak_radius;
    let bg2 = config.background_radius * config.background_radius;
    let peak_volume = sphere_volume(config.peak_radius);
    let background_volume = sphere_volume(config.background_radius) - peak_volume;

    peaks
        .par_iter_mut()
        .filter(|peak| config.accepts(peak))
        .map(|peak| {
            let center = peak.q_2pi();
            let (mut raw, mut shell) = (0.0, 0.0);
            for (q, weight) in events.iter() {
                let w = if config.use_weights { weight } else { 1.0 };
                let d2 = q.distance_squared(center);
                if d2 <= r2 {
                    raw += w;
                } else if d2 <= bg2 {
                    shell += w;
                }
            }
            let est = get_i_and_sig_i(raw, peak_volume, shell, background_volume);
            peak.set_intensity(est.intensity, est.sigma);
            peak.reflag += EVENT_SPHERE_REFLAG;
        })
        .count()
}

/// Integrates peaks on a histogram with [`Histogram3D::sphere_integrals`];
/// volumes are counted cells.
///
/// Peaks whose centre lies outside the histogram are skipped.
pub fn integrate_peaks_histogram(
    peaks: &mut [Peak],
    histogram: &Histogram3D,
    config: &SphereConfig,
) -> usize {
    let radii = [config.peak_radius, config.background_radius];
    let mut integrated = 0;
    for peak in peaks.iter_mut().filter(|p| config.accepts(p)) {
        let sums = match histogram.sphere_integrals(peak.q_2pi(), &radii) {
            Ok(sums) => sums,
            Err(err) => {
                log::warn!("skipping peak {}: {err}", peak.seqn);
                continue;
            }
        };
        let est = get_i_and_sig_i(
            sums.counts[0],
            sums.volumes[0],
            sums.counts[1] - sums.counts[0],
            sums.volumes[1] - sums.volumes[0],
        );
        peak.set_intensity(est.intensity, est.sigma);
        peak.reflag += HISTOGRAM_SPHERE_REFLAG;
        integrated += 1;
    }
    integrated
}

/// Disk and background sums of one page.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SliceIntegral {
    pub peak: f64,
    pub peak_pixels: usize,
    pub background: f64,
    pub background_pixels: usize,
}

/// Splits a `[row][col]` page into the disk of `radius` around
/// `(center_row, center_col)` and everything else. Cells are addressed by
/// their integer index.
#[must_use]
pub fn integrate_slice(
    page: ArrayView2<f64>,
    radius: f64,
    center_row: f64,
    center_col: f64,
) -> SliceIntegral {
    let r2 = radius * radius;
    let mut out = SliceIntegral::default();
    for ((row, col), &value) in page.indexed_iter() {
        let dr = index_f64(row) - center_row;
        let dc = index_f64(col) - center_col;
        if dr * dr + dc * dc <= r2 {
            out.peak += value;
            out.peak_pixels += 1;
        } else {
            out.background += value;
            out.background_pixels += 1;
        }
    }
    out
}

#[allow(clippy::cast_precision_loss)]
fn index_f64(i: usize) -> f64 {
    i as f64
}

/// Five slices of a disk around the working centre: the outer two are
/// background, the middle three signal.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn cylinder_integrate_5(list: &PeakEventList<'_>, radius: f64) -> IntensityEstimate {
    let half_width = radius.max(0.0).ceil() as usize;
    let hist = list.window_histogram(half_width, WindowShape::Circle, 5);
    let sums: Vec<f64> = hist.outer_iter().map(|page| page.sum()).collect();
    let background = sums[0] + sums[4];
    let raw = sums[1] + sums[2] + sums[3];
    get_i_and_sig_i(raw, 3.0, background, 2.0)
}

/// Seven slices over the whole partition box with a disk that widens away
/// from the centre slice; the radius is capped at half the box.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn integrate_slices(list: &PeakEventList<'_>, radius: f64) -> IntensityEstimate {
    let hist = list.full_histogram(CONE_SCALES.len());
    let (_, n_rows, n_cols) = hist.dim();
    let radius = radius
        .min((n_rows / 2) as f64)
        .min((n_cols / 2) as f64);
    let center_row = list.center().row - list.row_bounds().min;
    let center_col = list.center().col - list.col_bounds().min;

    let mut total = SliceIntegral::default();
    for (page, scale) in hist.outer_iter().zip(CONE_SCALES) {
        let slice = integrate_slice(page, radius * scale, center_row, center_col);
        total.peak += slice.peak;
        total.peak_pixels += slice.peak_pixels;
        total.background += slice.background;
        total.background_pixels += slice.background_pixels;
    }
    get_i_and_sig_i(
        total.peak,
        total.peak_pixels as f64,
        total.background,
        total.background_pixels as f64,
    )
}

/// I/σ of every sphere of a radius list against the shell just outside
/// it, from cumulative sphere sums.
#[must_use]
pub fn shell_profile(counts: &[f64], volumes: &[f64]) -> Vec<IntensityEstimate> {
    counts
        .windows(2)
        .zip(volumes.windows(2))
        .map(|(c, v)| get_i_and_sig_i(c[0], v[0], c[1] - c[0], v[1] - v[0]))
        .collect()
}

/// Index of the estimate with the largest I/σ.
#[must_use]
pub fn best_radius(profile: &[IntensityEstimate]) -> Option<usize> {
    profile
        .iter()
        .enumerate()
        .filter(|(_, e)| e.sigma > 0.0)
        .max_by(|a, b| a.1.i_over_sigma().total_cmp(&b.1.i_over_sigma()))
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;
    use qspace_core::{MillerIndex, Vec3};

    fn indexed_at(q: Vec3) -> Peak {
        let mut peak = Peak::at_q(q * (1.0 / std::f64::consts::TAU));
        peak.hkl = Some(MillerIndex::new(1, 0, 0));
        peak.row = 100.0;
        peak.col = 100.0;
        peak
    }

    #[test]
    fn test_event_sphere() {
        let center = Vec3::new(2.0, 0.0, 0.0);
        let mut events = QEventBatch::default();
        for _ in 0..10 {
            events.push(center);
        }
        events.push(center + Vec3::new(0.11, 0.0, 0.0));
        events.push(center + Vec3::new(0.0, 0.5, 0.0));

        let mut peaks = vec![indexed_at(center), Peak::at_q(Vec3::X)];
        let config = SphereConfig::default()
            .with_peak_radius(0.1)
            .with_background_radius(0.2);
        assert_eq!(integrate_peaks_events(&mut peaks, &events, &config), 1);

        let est = peaks[0].intensity.unwrap();
        // shell volume is 7x the peak sphere
        assert_relative_eq!(est.intensity, 10.0 - 1.0 / 7.0, epsilon = 1e-9);
        assert_eq!(peaks[0].reflag, 500);
        assert!(!peaks[1].is_integrated());
    }

    #[test]
    fn test_detector_window() {
        let mut peak = indexed_at(Vec3::X);
        peak.row = 10.0;
        let mut peaks = vec![peak];
        let events = QEventBatch::default();
        assert_eq!(integrate_peaks_events(&mut peaks, &events, &SphereConfig::default()), 0);
        let open = SphereConfig::default().with_detector_window(None);
        assert_eq!(integrate_peaks_events(&mut peaks, &events, &open), 1);
    }

    #[test]
    fn test_slice_split() {
        let page = Array2::from_elem((5, 5), 1.0);
        let slice = integrate_slice(page.view(), 1.0, 2.0, 2.0);
        assert_eq!(slice.peak_pixels, 5);
        assert_eq!(slice.background_pixels, 20);
        assert_relative_eq!(slice.peak, 5.0);
        assert_relative_eq!(slice.background, 20.0);
    }

    #[test]
    fn test_shell_profile_picks_peak_radius() {
        let counts = [10.0, 100.0, 110.0, 120.0];
        let volumes = [1.0, 2.0, 3.0, 4.0];
        let profile = shell_profile(&counts, &volumes);
        assert_eq!(profile.len(), 3);
        assert_relative_eq!(profile[0].intensity, -80.0);
        assert_relative_eq!(profile[1].intensity, 80.0);
        assert_eq!(best_radius(&profile), Some(1));
    }
}
