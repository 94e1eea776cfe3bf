//! Sorted local-maximum peak search over a stack of histogram pages.
//!
//! The data is addressed as `[chan][row][col]`, which for a
//! [`Histogram3D`] is `[z][y][x]`. Cell `i` spans `[i, i + 1)` in the
//! fractional coordinates returned here, so a cell centre is `i + 0.5`.

use std::ops::Range;

use ndarray::{s, Array3, ArrayView3};
use qspace_core::{Histogram3D, Peak};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const LOCAL_MAX_HALF_WIDTH: usize = 3;
const CENTROID_ITERATIONS: usize = 6;
const MAX_CENTROID_MOVE: f64 = 5.0;
const INITIAL_EXTENT: f64 = 1.0;

/// Peak search parameters.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PeakFinderConfig {
    /// Maximum number of peaks to accept.
    pub max_peaks: usize,
    /// Minimum count for a candidate; computed from the data when `None`.
    pub threshold: Option<f64>,
    /// Replace every cell by its 3x3 in-page neighbourhood sum first.
    pub smooth: bool,
    /// Rows searched (0-based); all rows when `None`.
    pub rows: Option<Range<usize>>,
    /// Columns searched (0-based); all columns when `None`.
    pub cols: Option<Range<usize>>,
    /// Channels searched (0-based); all channels when `None`.
    pub channels: Option<Range<usize>>,
}

impl Default for PeakFinderConfig {
    fn default() -> Self {
        Self {
            max_peaks: 30,
            threshold: None,
            smooth: false,
            rows: None,
            cols: None,
            channels: None,
        }
    }
}

impl PeakFinderConfig {
    #[must_use]
    pub fn with_max_peaks(mut self, max_peaks: usize) -> Self {
        self.max_peaks = max_peaks;
        self
    }

    #[must_use]
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    #[must_use]
    pub fn with_smoothing(mut self, smooth: bool) -> Self {
        self.smooth = smooth;
        self
    }

    #[must_use]
    pub fn with_rows(mut self, rows: Range<usize>) -> Self {
        self.rows = Some(rows);
        self
    }

    #[must_use]
    pub fn with_cols(mut self, cols: Range<usize>) -> Self {
        self.cols = Some(cols);
        self
    }

    #[must_use]
    pub fn with_channels(mut self, channels: Range<usize>) -> Self {
        self.channels = Some(channels);
        self
    }
}

/// A peak accepted by the search.
#[derive(Clone, Debug, PartialEq)]
pub struct PeakCandidate {
    pub row: f64,
    pub col: f64,
    pub chan: f64,
    pub delta_row: f64,
    pub delta_col: f64,
    pub delta_chan: f64,
    /// Count in the seed cell.
    pub ipk: f64,
    /// Passed at least one of the peak quality tests.
    pub valid: bool,
}

impl PeakCandidate {
    fn seed(row: usize, col: usize, chan: usize, ipk: f64) -> Self {
        Self {
            row: idx(row) + 0.5,
            col: idx(col) + 0.5,
            chan: idx(chan) + 0.5,
            delta_row: 2.0 * INITIAL_EXTENT,
            delta_col: 2.0 * INITIAL_EXTENT,
            delta_chan: INITIAL_EXTENT,
            ipk,
            valid: false,
        }
    }

    fn covers(&self, row: usize, col: usize, chan: usize) -> bool {
        (idx(row) + 0.5 - self.row).abs() <= 2.0 * self.delta_row + 1.0
            && (idx(col) + 0.5 - self.col).abs() <= 2.0 * self.delta_col + 1.0
            && (idx(chan) + 0.5 - self.chan).abs() <= 2.0 * self.delta_chan + 1.0
    }

    fn overlaps(&self, other: &PeakCandidate) -> bool {
        (self.row - other.row).abs() <= 2.0 * (self.delta_row + other.delta_row) + 1.0
            && (self.col - other.col).abs() <= 2.0 * (self.delta_col + other.delta_col) + 1.0
            && (self.chan - other.chan).abs() <= 2.0 * (self.delta_chan + other.delta_chan) + 1.0
    }
}

#[allow(clippy::cast_precision_loss)]
fn idx(i: usize) -> f64 {
    i as f64
}

#[allow(clippy::cast_possible_truncation)]
fn trunc(x: f64) -> i64 {
    x as i64
}

fn clamp_index(x: i64, len: usize) -> usize {
    usize::try_from(x.max(0)).map_or(0, |v| v.min(len.saturating_sub(1)))
}

/// Statistics of one channel around a candidate.
#[derive(Clone, Copy, Debug, Default)]
struct SliceStats {
    chan: usize,
    ipk: f64,
    row_mean: f64,
    col_mean: f64,
    row_std: f64,
    col_std: f64,
    peak_num: usize,
    back_num: usize,
    peak_total: f64,
    back_total: f64,
    row_value_sum: f64,
    col_value_sum: f64,
    row_index_sum: f64,
    col_index_sum: f64,
}

impl SliceStats {
    fn back_ave(&self) -> f64 {
        if self.back_num == 0 {
            0.0
        } else {
            self.back_total / idx(self.back_num)
        }
    }

    fn peak_ave(&self) -> f64 {
        if self.peak_num == 0 {
            0.0
        } else {
            self.peak_total / idx(self.peak_num)
        }
    }

    fn signal(&self) -> f64 {
        self.peak_ave() - self.back_ave()
    }

    /// Background-subtracted centroid of the peak region.
    fn centroid(&self, value_sum: f64, index_sum: f64) -> Option<f64> {
        if self.back_num == 0 {
            return None;
        }
        let back = self.back_ave();
        let net = self.peak_total - idx(self.peak_num) * back;
        (net > 0.0).then(|| (value_sum - index_sum * back) / net)
    }

    fn row_centroid(&self) -> Option<f64> {
        self.centroid(self.row_value_sum, self.row_index_sum)
    }

    fn col_centroid(&self) -> Option<f64> {
        self.centroid(self.col_value_sum, self.col_index_sum)
    }
}

struct Slicer<'a, 'b> {
    data: &'a ArrayView3<'b, f64>,
    n_rows: usize,
    n_cols: usize,
}

impl Slicer<'_, '_> {
    fn window(&self, mean: f64, half: f64, len: usize) -> Range<usize> {
        clamp_index(trunc(mean - half), len)..clamp_index(trunc(mean + half), len) + 1
    }

    /// One refinement of the mean and standard deviation on a window of
    /// two standard deviations (at least two cells).
    fn refine(&self, info: SliceStats) -> SliceStats {
        let mut next = info;
        let row_step = if info.row_std >= 1.0 { 2.0 * info.row_std } else { 2.0 };
        let col_step = if info.col_std >= 1.0 { 2.0 * info.col_std } else { 2.0 };

        let (mut total, mut ipk) = (0.0, 0.0_f64);
        let (mut row_sum, mut col_sum, mut row_sum_2, mut col_sum_2) = (0.0, 0.0, 0.0, 0.0);
        for row in self.window(info.row_mean, row_step, self.n_rows) {
            for col in self.window(info.col_mean, col_step, self.n_cols) {
                let value = self.data[[info.chan, row, col]];
                let (r, c) = (idx(row) + 0.5, idx(col) + 0.5);
                total += value;
                ipk = ipk.max(value);
                row_sum += r * value;
                col_sum += c * value;
                row_sum_2 += r * r * value;
                col_sum_2 += c * c * value;
            }
        }
        next.ipk = ipk;
        if total != 0.0 {
            next.row_mean = row_sum / total;
            next.col_mean = col_sum / total;
            let row_var = row_sum_2 / total - next.row_mean * next.row_mean;
            let col_var = col_sum_2 / total - next.col_mean * next.col_mean;
            // standard deviations never shrink below one cell
            if row_var >= 1.0 {
                next.row_std = row_var.sqrt();
            }
            if col_var >= 1.0 {
                next.col_std = col_var.sqrt();
            }
        }
        next
    }

    /// Splits the neighbourhood into a disk of radius `2 * std` and the
    /// surrounding background.
    fn centroid_stats(&self, info: SliceStats) -> SliceStats {
        let mut next = info;
        let dx = 2.0 * info.col_std;
        let dy = 2.0 * info.row_std;
        let radius_squared = dx * dx + dy * dy;
        next.ipk = 0.0;
        for row in self.window(info.row_mean, 2.0 * info.row_std + 2.0, self.n_rows) {
            for col in self.window(info.col_mean, 2.0 * info.col_std + 2.0, self.n_cols) {
                let value = self.data[[info.chan, row, col]];
                let (r, c) = (idx(row) + 0.5, idx(col) + 0.5);
                next.ipk = next.ipk.max(value);
                let (dr, dc) = (r - info.row_mean, c - info.col_mean);
                if dr * dr + dc * dc >= radius_squared {
                    next.back_total += value;
                    next.back_num += 1;
                } else {
                    next.peak_total += value;
                    next.peak_num += 1;
                    next.row_index_sum += r;
                    next.col_index_sum += c;
                    next.row_value_sum += r * value;
                    next.col_value_sum += c * value;
                }
            }
        }
        next
    }

    fn slice(&self, chan: usize, row_mean: f64, col_mean: f64) -> SliceStats {
        let mut info = SliceStats {
            chan,
            row_mean,
            col_mean,
            row_std: 1.0,
            col_std: 1.0,
            ..SliceStats::default()
        };
        for _ in 0..CENTROID_ITERATIONS {
            info = self.refine(info);
        }
        self.centroid_stats(info)
    }
}

/// Centroids a seed and applies the quality tests. Returns `false` when the
/// centroid is undefined.
fn centroid_and_extent(candidate: &mut PeakCandidate, data: &ArrayView3<f64>) -> bool {
    let (n_pages, n_rows, n_cols) = data.dim();
    let first = trunc((candidate.chan - 2.0).floor());
    let last = trunc((candidate.chan + 2.0).floor());
    if first < 0 || last >= i64::try_from(n_pages).unwrap_or(i64::MAX) {
        return false;
    }
    let slicer = Slicer {
        data,
        n_rows,
        n_cols,
    };
    let slices: Vec<SliceStats> = (clamp_index(first, n_pages)..=clamp_index(last, n_pages))
        .map(|chan| slicer.slice(chan, candidate.row, candidate.col))
        .collect();
    let centre = slices[2];

    let (Some(row), Some(col)) = (centre.row_centroid(), centre.col_centroid()) else {
        return false;
    };
    if (row - candidate.row).abs() < MAX_CENTROID_MOVE {
        candidate.row = row;
    }
    if (col - candidate.col).abs() < MAX_CENTROID_MOVE {
        candidate.col = col;
    }
    let weight: f64 = slices[1..4].iter().map(|s| s.ipk).sum();
    if weight > 0.0 {
        let weighted: f64 = slices[1..4].iter().map(|s| s.ipk * idx(s.chan)).sum();
        candidate.chan = weighted / weight + 0.5;
    }
    candidate.delta_row = 2.0 * centre.row_std;
    candidate.delta_col = 2.0 * centre.col_std;

    let side_ipk = (slices[0].ipk + slices[4].ipk) / 2.0;
    let ipk_test = if side_ipk > 0.0 {
        centre.ipk / side_ipk > 3.0
    } else {
        centre.ipk > 9.0
    };
    let back_ave = centre.back_ave();
    let contrast_test = back_ave > 0.0 && centre.peak_ave() / back_ave > 4.0;
    let side_signal = ((slices[0].signal() + slices[4].signal()) / 2.0).abs();
    let signal_test = if side_signal > 0.0 {
        centre.signal() / side_signal > 12.0
    } else {
        centre.signal() > 12.0
    };
    candidate.valid = ipk_test || contrast_test || signal_test;
    true
}

/// 3x3 neighbourhood sums within each page; border cells are zero.
#[must_use]
pub fn smooth(data: &ArrayView3<f64>) -> Array3<f64> {
    let (n_pages, n_rows, n_cols) = data.dim();
    let mut out = Array3::zeros((n_pages, n_rows, n_cols));
    if n_rows < 3 || n_cols < 3 {
        return out;
    }
    for chan in 0..n_pages {
        for row in 1..n_rows - 1 {
            for col in 1..n_cols - 1 {
                let mut sum = 0.0;
                for r in row - 1..=row + 1 {
                    for c in col - 1..=col + 1 {
                        sum += data[[chan, r, c]];
                    }
                }
                out[[chan, row, col]] = sum;
            }
        }
    }
    out
}

/// Threshold selecting about the top 0.1% of cells, raised so that at most
/// 1% qualify and lowered so that at least one does.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn automatic_threshold(data: &ArrayView3<f64>, explicit: Option<f64>, smoothed: bool) -> i64 {
    let mut counts: Vec<i64> = data.iter().map(|&v| v.max(0.0) as i64).collect();
    counts.sort_unstable();
    let n = counts.len();
    // smallest t with at least `cutoff` values <= t
    let at_rank = |cutoff: usize| if cutoff == 0 { 0 } else { counts[cutoff - 1] };

    let mut threshold = match explicit {
        Some(t) if t > 0.0 => t as i64,
        _ => at_rank((n as f64 * 0.999) as usize),
    };
    threshold = threshold.max(at_rank((n as f64 * 0.99) as usize));
    if let Some(&max) = counts.last() {
        if threshold >= max {
            threshold = (max - 1).max(0);
        }
    }
    threshold.max(if smoothed { 5 } else { 3 })
}

/// Finds up to `max_peaks` peaks in `[chan][row][col]` data.
///
/// Every returned candidate passed the overlap, local maximum and centroid
/// checks; `valid` records whether it also passed a quality test.
#[must_use]
pub fn find_peaks(data: ArrayView3<f64>, config: &PeakFinderConfig) -> Vec<PeakCandidate> {
    let (n_pages, n_rows, n_cols) = data.dim();
    if n_pages == 0 || n_rows == 0 || n_cols == 0 {
        return Vec::new();
    }
    let smoothed;
    let data = if config.smooth {
        smoothed = smooth(&data);
        smoothed.view()
    } else {
        data.view()
    };

    let threshold = automatic_threshold(&data, config.threshold, config.smooth);
    log::debug!("peak search threshold {threshold}");

    let clip = |range: &Option<Range<usize>>, len: usize| match range {
        Some(r) => r.start.min(len)..r.end.min(len),
        None => 0..len,
    };
    let rows = clip(&config.rows, n_rows);
    let cols = clip(&config.cols, n_cols);
    let chans = clip(&config.channels, n_pages);

    let mut candidates = Vec::new();
    for row in rows {
        for col in cols.clone() {
            for chan in chans.clone() {
                let value = data[[chan, row, col]];
                if trunc(value) > threshold {
                    candidates.push((value, row, col, chan));
                }
            }
        }
    }
    // stable: equal values keep scan order
    candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut peaks: Vec<PeakCandidate> = Vec::new();
    for (value, row, col, chan) in candidates {
        if peaks.len() >= config.max_peaks {
            break;
        }
        if peaks.iter().any(|p| p.covers(row, col, chan)) {
            continue;
        }
        if !is_local_max(&data, row, col, chan) {
            continue;
        }
        let mut peak = PeakCandidate::seed(row, col, chan, value);
        if !centroid_and_extent(&mut peak, &data) {
            log::trace!("undefined centroid at col {col} row {row} chan {chan}");
            continue;
        }
        if peaks.iter().any(|p| p.overlaps(&peak)) {
            continue;
        }
        peaks.push(peak);
    }
    log::debug!("found {} peaks", peaks.len());
    peaks
}

fn is_local_max(data: &ArrayView3<f64>, row: usize, col: usize, chan: usize) -> bool {
    let (n_pages, n_rows, n_cols) = data.dim();
    let h = LOCAL_MAX_HALF_WIDTH;
    let centre = data[[chan, row, col]];
    let pages = chan.saturating_sub(h)..=(chan + h).min(n_pages - 1);
    let rows = row.saturating_sub(h)..=(row + h).min(n_rows - 1);
    let cols = col.saturating_sub(h)..=(col + h).min(n_cols - 1);
    data.slice(s![pages, rows, cols])
        .iter()
        .all(|&v| v <= centre)
}

/// Searches a histogram and converts the valid peaks to Q/2π.
///
/// Pages are z slices, rows run along y and columns along x.
#[must_use]
pub fn find_histogram_peaks(histogram: &Histogram3D, config: &PeakFinderConfig) -> Vec<Peak> {
    find_peaks(histogram.cells(), config)
        .into_iter()
        .filter(|c| c.valid)
        .enumerate()
        .map(|(i, c)| {
            let q = histogram.position_at(c.col, c.row, c.chan);
            let mut peak = Peak::at_q(q * (1.0 / std::f64::consts::TAU));
            peak.seqn = u32::try_from(i + 1).unwrap_or(u32::MAX);
            peak.ipk = histogram.value_at(q);
            peak
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn blob(dims: (usize, usize, usize), centre: (f64, f64, f64), height: f64) -> Array3<f64> {
        Array3::from_shape_fn(dims, |(chan, row, col)| {
            let dc = idx(chan) - centre.0;
            let dr = idx(row) - centre.1;
            let dl = idx(col) - centre.2;
            1.0 + height * (-(dc * dc + dr * dr + dl * dl) / 2.0).exp()
        })
    }

    #[test]
    fn test_single_blob() {
        let data = blob((20, 24, 30), (10.0, 12.0, 15.0), 200.0);
        let peaks = find_peaks(data.view(), &PeakFinderConfig::default());
        assert_eq!(peaks.len(), 1);
        let peak = &peaks[0];
        assert!(peak.valid);
        assert_relative_eq!(peak.row, 12.5, epsilon = 1e-6);
        assert_relative_eq!(peak.col, 15.5, epsilon = 1e-6);
        assert_relative_eq!(peak.chan, 10.5, epsilon = 1e-6);
        assert_relative_eq!(peak.ipk, 201.0);
    }

    #[test]
    fn test_smoothed_single_blob() {
        let data = blob((20, 24, 30), (10.0, 12.0, 15.0), 200.0);
        let config = PeakFinderConfig::default().with_smoothing(true);
        let peaks = find_peaks(data.view(), &config);
        assert_eq!(peaks.len(), 1);
        let peak = &peaks[0];
        assert!(peak.valid);
        assert_relative_eq!(peak.row, 12.5, epsilon = 1e-6);
        assert_relative_eq!(peak.col, 15.5, epsilon = 1e-6);
        assert_relative_eq!(peak.chan, 10.5, epsilon = 1e-6);
        assert!(peak.ipk > 201.0);
    }

    #[test]
    fn test_two_blobs_sorted_by_height() {
        let mut data = blob((20, 40, 40), (10.0, 10.0, 10.0), 100.0);
        data += &blob((20, 40, 40), (10.0, 30.0, 28.0), 300.0);
        let peaks = find_peaks(data.view(), &PeakFinderConfig::default());
        assert_eq!(peaks.len(), 2);
        assert_relative_eq!(peaks[0].row, 30.5, epsilon = 1e-3);
        assert_relative_eq!(peaks[1].row, 10.5, epsilon = 1e-3);
    }

    #[test]
    fn test_row_mask_excludes_peak() {
        let data = blob((20, 24, 30), (10.0, 12.0, 15.0), 200.0);
        let config = PeakFinderConfig::default().with_rows(0..8);
        assert!(find_peaks(data.view(), &config).is_empty());
    }

    #[test]
    fn test_edge_channel_rejected() {
        let data = blob((20, 24, 30), (1.0, 12.0, 15.0), 200.0);
        assert!(find_peaks(data.view(), &PeakFinderConfig::default()).is_empty());
    }

    #[test]
    fn test_flat_data_has_no_peaks() {
        let data = Array3::from_elem((8, 8, 8), 2.0);
        assert!(find_peaks(data.view(), &PeakFinderConfig::default()).is_empty());
    }

    #[test]
    fn test_threshold_floor() {
        let data = Array3::from_elem((4, 4, 4), 1.0);
        assert_eq!(automatic_threshold(&data.view(), None, false), 3);
        assert_eq!(automatic_threshold(&data.view(), None, true), 5);
        assert_eq!(automatic_threshold(&data.view(), Some(40.0), false), 3);
    }
}
