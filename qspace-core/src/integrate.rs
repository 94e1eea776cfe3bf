//! Background-subtracted intensity statistics.
//!
//! Every integration mode (event spheres, histogram shells, cylinder
//! slices, lattice quick-integrate) reduces to [`get_i_and_sig_i`].

use crate::peak::IntensityEstimate;

/// Ratio of background-sphere radius to peak-sphere radius giving equal
/// peak and shell volumes (cube root of 2).
pub const BACKGROUND_RATIO: f64 = 1.259_921_05;

/// Net intensity and sigma from a raw region and a background region.
///
/// With `ratio = raw_volume / background_volume` the result is
/// `raw - ratio * background` and `sqrt(raw + ratio^2 * background)`,
/// assuming independent Poisson counts. When `background_volume <= 0`
/// no background can be estimated and `(raw, 0)` is returned.
#[must_use]
pub fn get_i_and_sig_i(
    raw_signal: f64,
    raw_volume: f64,
    background: f64,
    background_volume: f64,
) -> IntensityEstimate {
    if background_volume <= 0.0 {
        return IntensityEstimate {
            intensity: raw_signal,
            sigma: 0.0,
        };
    }
    let ratio = raw_volume / background_volume;
    IntensityEstimate {
        intensity: raw_signal - ratio * background,
        sigma: (raw_signal + ratio * ratio * background).sqrt(),
    }
}

/// Volume of a sphere.
#[must_use]
pub fn sphere_volume(radius: f64) -> f64 {
    4.0 / 3.0 * std::f64::consts::PI * radius * radius * radius
}

/// `n` radii `r, 2r, 3r, ...` starting at `min_radius`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn uniform_radii(min_radius: f64, n: usize) -> Vec<f64> {
    (1..=n).map(|i| min_radius * i as f64).collect()
}

/// `n` radii in geometric progression starting at `min_radius`.
///
/// A `ratio` of [`BACKGROUND_RATIO`] doubles the enclosed volume per step.
#[must_use]
pub fn geometric_radii(min_radius: f64, n: usize, ratio: f64) -> Vec<f64> {
    std::iter::successors(Some(min_radius), |r| Some(r * ratio))
        .take(n)
        .collect()
}

/// `n` radii whose successive shells all enclose the volume of the first
/// sphere.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn uniform_volume_radii(min_radius: f64, n: usize) -> Vec<f64> {
    (1..=n).map(|i| min_radius * (i as f64).cbrt()).collect()
}
