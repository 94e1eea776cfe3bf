//! Per-pixel time-of-flight to Q lookup tables.

use qspace_core::{QEventBatch, RawEventBatch, Vec3};

use crate::calibration::InstrumentCalibration;

/// Angstroms per (microsecond per meter): `lambda = ANGST_PER_US_PER_M * t / L`.
pub const ANGST_PER_US_PER_M: f64 = 3.956_058e-3;

/// Spectrum samples per Angstrom.
pub const SPECTRUM_STEPS_PER_ANGSTROM: f64 = 100.0;

/// Longest tabulated wavelength in Angstroms.
pub const MAX_SPECTRUM_WAVELENGTH: f64 = 50.0;

/// Incident-spectrum correction indexed by wavelength.
#[derive(Debug, Clone, PartialEq)]
pub struct IncidentSpectrum {
    weights: Vec<f64>,
}

impl IncidentSpectrum {
    /// Builds event weights from spectrum values sampled every 0.01 Angstrom.
    ///
    /// Positive values give a weight of `1 / value`; anything else leaves
    /// events unweighted.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn from_values(values: &[f64]) -> Self {
        let len = (MAX_SPECTRUM_WAVELENGTH * SPECTRUM_STEPS_PER_ANGSTROM) as usize + 1;
        let weights = (0..len)
            .map(|i| match values.get(i) {
                Some(&v) if v > 0.0 => 1.0 / v,
                _ => 1.0,
            })
            .collect();
        Self { weights }
    }

    /// Weight for a wavelength; out-of-table wavelengths clamp to the ends.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn weight(&self, wavelength: f64) -> f64 {
        let index = (wavelength * SPECTRUM_STEPS_PER_ANGSTROM).round();
        let index = if index.is_nan() || index < 0.0 {
            0
        } else {
            (index as usize).min(self.weights.len() - 1)
        };
        self.weights[index]
    }
}

/// Result of mapping one raw batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappedBatch {
    pub events: QEventBatch,
    /// Events dropped for an invalid pixel id.
    pub skipped: usize,
}

/// Precomputed `|Q| * tof` and unit Q direction for every pixel.
///
/// The beam travels along +x. Times are in 100 ns ticks; the calibration
/// T0 shift (microseconds) is added before dividing. `|Q|` includes the
/// factor 2π.
#[derive(Debug, Clone)]
pub struct TofToQMap {
    first_id: u32,
    mag_q_times_tof: Vec<f64>,
    unit_q: Vec<Vec3>,
    total_path: Vec<f64>,
    t0: f64,
    spectrum: Option<IncidentSpectrum>,
}

impl TofToQMap {
    #[must_use]
    pub fn new(calibration: &InstrumentCalibration) -> Self {
        let part = 10.0 * 4.0 * std::f64::consts::PI / ANGST_PER_US_PER_M;
        let l1 = calibration.l1();
        let first_id = calibration.first_pixel_id();
        let n = calibration.num_pixels();

        let mut mag_q_times_tof = Vec::with_capacity(n);
        let mut unit_q = Vec::with_capacity(n);
        let mut total_path = Vec::with_capacity(n);
        for offset in 0..n {
            // every id in [first, first + n) has a location
            let position = u32::try_from(offset)
                .ok()
                .and_then(|o| calibration.pixel(first_id + o))
                .map_or(Vec3::X, |loc| loc.position);
            let l2 = position.length();
            let two_theta = (position.x / l2).clamp(-1.0, 1.0).acos();
            let direction = (position - Vec3::X * l2).normalized().unwrap_or_default();
            mag_q_times_tof.push(part * (l1 + l2) * (two_theta / 2.0).sin());
            unit_q.push(direction);
            total_path.push(l1 + l2);
        }

        Self {
            first_id,
            mag_q_times_tof,
            unit_q,
            total_path,
            t0: calibration.t0_shift() * 10.0,
            spectrum: calibration.spectrum().map(IncidentSpectrum::from_values),
        }
    }

    /// Replaces the incident-spectrum correction.
    #[must_use]
    pub fn with_spectrum(mut self, spectrum: Option<IncidentSpectrum>) -> Self {
        self.spectrum = spectrum;
        self
    }

    #[must_use]
    pub fn num_pixels(&self) -> usize {
        self.unit_q.len()
    }

    fn slot(&self, pixel_id: u32) -> Option<usize> {
        let slot = pixel_id.checked_sub(self.first_id)? as usize;
        (slot < self.unit_q.len()).then_some(slot)
    }

    /// Q vector of one event, or `None` for an invalid pixel id or a
    /// non-positive total time.
    #[must_use]
    pub fn q_of(&self, tof: u32, pixel_id: u32) -> Option<Vec3> {
        let slot = self.slot(pixel_id)?;
        let t = self.t0 + f64::from(tof);
        if t <= 0.0 {
            return None;
        }
        Some(self.unit_q[slot] * (self.mag_q_times_tof[slot] / t))
    }

    /// Wavelength in Angstroms of one event.
    #[must_use]
    pub fn wavelength(&self, tof: u32, pixel_id: u32) -> Option<f64> {
        let slot = self.slot(pixel_id)?;
        let t = (self.t0 + f64::from(tof)) / 10.0;
        Some(t * ANGST_PER_US_PER_M / self.total_path[slot])
    }

    /// Event weight from the incident spectrum; 1 without a spectrum.
    #[must_use]
    pub fn weight(&self, tof: u32, pixel_id: u32) -> f64 {
        match (&self.spectrum, self.wavelength(tof, pixel_id)) {
            (Some(spectrum), Some(lambda)) => spectrum.weight(lambda),
            _ => 1.0,
        }
    }

    /// Q vector and weight of one event.
    #[must_use]
    pub fn map_event(&self, tof: u32, pixel_id: u32) -> Option<(Vec3, f64)> {
        let q = self.q_of(tof, pixel_id)?;
        Some((q, self.weight(tof, pixel_id)))
    }

    /// Maps a raw batch, dropping events with invalid pixel ids.
    #[must_use]
    pub fn map_batch(&self, batch: &RawEventBatch) -> MappedBatch {
        let mut events = QEventBatch::with_capacity(batch.len());
        let mut skipped = 0;
        for event in batch.iter() {
            match self.map_event(event.tof, event.pixel_id) {
                Some((q, weight)) => events.push_weighted(q, weight),
                None => skipped += 1,
            }
        }
        MappedBatch { events, skipped }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DetectorGrid, Instrument};
    use approx::assert_relative_eq;

    /// A single pixel straight up (+y) at 0.5 m, 2θ = 90°.
    fn one_pixel() -> InstrumentCalibration {
        let grid = DetectorGrid::new(1, 1, 1, 0.01, 0.01, Vec3::Y * 0.5, Vec3::X, Vec3::Z).unwrap();
        InstrumentCalibration::new(Instrument::Topaz, 18.0, 0.0, vec![grid]).unwrap()
    }

    #[test]
    fn test_magnitude_and_direction() {
        let map = TofToQMap::new(&one_pixel());
        let tof = 100_000; // 10 ms
        let q = map.q_of(tof, 1).unwrap();

        let lambda = 10_000.0 * ANGST_PER_US_PER_M / 18.5;
        let expected = 4.0 * std::f64::consts::PI * (std::f64::consts::FRAC_PI_4).sin() / lambda;
        assert_relative_eq!(q.length(), expected, max_relative = 1e-12);
        // direction bisects -x and +y
        assert_relative_eq!(q.x, -q.y, max_relative = 1e-12);
        assert_relative_eq!(q.z, 0.0);
        assert_relative_eq!(map.wavelength(tof, 1).unwrap(), lambda, max_relative = 1e-12);
    }

    #[test]
    fn test_invalid_ids_skipped() {
        let map = TofToQMap::new(&one_pixel());
        assert!(map.q_of(100, 0).is_none());
        assert!(map.q_of(100, 2).is_none());
        assert!(map.q_of(0, 1).is_none());

        let batch: RawEventBatch = [(500, 1), (500, 0), (500, 7), (800, 1)]
            .into_iter()
            .map(|(tof, pixel_id)| qspace_core::RawEvent { tof, pixel_id })
            .collect();
        let mapped = map.map_batch(&batch);
        assert_eq!(mapped.events.len(), 2);
        assert_eq!(mapped.skipped, 2);
    }

    #[test]
    fn test_spectrum_weights() {
        let spectrum = IncidentSpectrum::from_values(&[0.0, 4.0, -1.0]);
        assert_relative_eq!(spectrum.weight(0.0), 1.0);
        assert_relative_eq!(spectrum.weight(0.01), 0.25);
        assert_relative_eq!(spectrum.weight(0.02), 1.0);
        assert_relative_eq!(spectrum.weight(-3.0), 1.0);
        assert_relative_eq!(spectrum.weight(1e9), 1.0);
    }
}
