//! One-dimensional |Q| and d-spacing profiles of all accumulated events.

use qspace_core::QEventBatch;

pub const DQ_NUM_BINS: usize = 10_000;
/// Upper end of the |Q| axis (1/Å, including 2π).
pub const DQ_MAX_Q: f64 = 20.0;
/// Upper end of the d-spacing axis (Å).
pub const DQ_MAX_D: f64 = 10.0;
/// Leading bins reported as zero.
const SUPPRESSED_BINS: usize = 2;

/// Axis of a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfileKind {
    MagQ,
    DSpacing,
}

impl ProfileKind {
    fn max(self) -> f64 {
        match self {
            ProfileKind::MagQ => DQ_MAX_Q,
            ProfileKind::DSpacing => DQ_MAX_D,
        }
    }
}

/// Event counts and weight sums on fixed |Q| and d axes.
///
/// Each axis has `DQ_NUM_BINS + 1` bins; bin `i` starts at
/// `i * max / DQ_NUM_BINS`.
#[derive(Debug, Clone, PartialEq)]
pub struct DqProfile {
    q_counts: Vec<f64>,
    q_weights: Vec<f64>,
    d_counts: Vec<f64>,
    d_weights: Vec<f64>,
}

impl Default for DqProfile {
    fn default() -> Self {
        Self::new()
    }
}

impl DqProfile {
    #[must_use]
    pub fn new() -> Self {
        Self {
            q_counts: vec![0.0; DQ_NUM_BINS + 1],
            q_weights: vec![0.0; DQ_NUM_BINS + 1],
            d_counts: vec![0.0; DQ_NUM_BINS + 1],
            d_weights: vec![0.0; DQ_NUM_BINS + 1],
        }
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn bin(value: f64, max: f64) -> Option<usize> {
        let bin = (DQ_NUM_BINS as f64 * value / max).floor();
        (bin >= 0.0 && bin <= DQ_NUM_BINS as f64).then_some(bin as usize)
    }

    /// Adds every event once to the count arrays and with its weight to the
    /// weighted arrays.
    pub fn add_events(&mut self, events: &QEventBatch) {
        for (q, weight) in events.iter() {
            let mag_q = q.length();
            if let Some(bin) = Self::bin(mag_q, DQ_MAX_Q) {
                self.q_counts[bin] += 1.0;
                self.q_weights[bin] += weight;
            }
            if mag_q > 0.0 {
                let d = std::f64::consts::TAU / mag_q;
                if let Some(bin) = Self::bin(d, DQ_MAX_D) {
                    self.d_counts[bin] += 1.0;
                    self.d_weights[bin] += weight;
                }
            }
        }
    }

    pub fn clear(&mut self) {
        for values in [
            &mut self.q_counts,
            &mut self.q_weights,
            &mut self.d_counts,
            &mut self.d_weights,
        ] {
            values.fill(0.0);
        }
    }

    /// Lower bin edges of an axis.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn x_values(kind: ProfileKind) -> Vec<f64> {
        (0..=DQ_NUM_BINS)
            .map(|i| i as f64 * kind.max() / DQ_NUM_BINS as f64)
            .collect()
    }

    /// Profile values with the first two bins zeroed.
    ///
    /// Weighted values are multiplied by `scale` when it is positive; raw
    /// counts are never scaled.
    #[must_use]
    pub fn values(&self, kind: ProfileKind, weighted: bool, scale: Option<f64>) -> Vec<f64> {
        let source = match (kind, weighted) {
            (ProfileKind::MagQ, false) => &self.q_counts,
            (ProfileKind::MagQ, true) => &self.q_weights,
            (ProfileKind::DSpacing, false) => &self.d_counts,
            (ProfileKind::DSpacing, true) => &self.d_weights,
        };
        let factor = match scale {
            Some(s) if weighted && s > 0.0 => s,
            _ => 1.0,
        };
        source
            .iter()
            .enumerate()
            .map(|(i, &v)| if i < SUPPRESSED_BINS { 0.0 } else { v * factor })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use qspace_core::Vec3;

    #[test]
    fn test_q_and_d_bins() {
        let mut profile = DqProfile::new();
        let mut events = QEventBatch::default();
        events.push_weighted(Vec3::new(0.0, 3.0, 4.0), 0.5);
        events.push(Vec3::new(0.0, 0.0, 0.001));
        events.push(Vec3::new(25.0, 0.0, 0.0));
        profile.add_events(&events);

        let q = profile.values(ProfileKind::MagQ, false, None);
        assert_eq!(q.len(), DQ_NUM_BINS + 1);
        assert_relative_eq!(q[2500], 1.0);
        // near-zero |Q| lands in a suppressed bin
        assert_relative_eq!(q.iter().sum::<f64>(), 1.0);

        let d_bin = (std::f64::consts::TAU / 5.0 * 1000.0).floor() as usize;
        let d = profile.values(ProfileKind::DSpacing, true, Some(4.0));
        assert_relative_eq!(d[d_bin], 2.0);
        let d = profile.values(ProfileKind::DSpacing, true, Some(-1.0));
        assert_relative_eq!(d[d_bin], 0.5);
    }

    #[test]
    fn test_clear() {
        let mut profile = DqProfile::new();
        let mut events = QEventBatch::default();
        events.push(Vec3::new(1.0, 1.0, 1.0));
        profile.add_events(&events);
        profile.clear();
        assert!(profile
            .values(ProfileKind::MagQ, false, None)
            .iter()
            .all(|&v| v == 0.0));
        assert_relative_eq!(DqProfile::x_values(ProfileKind::DSpacing)[DQ_NUM_BINS], DQ_MAX_D);
    }
}
