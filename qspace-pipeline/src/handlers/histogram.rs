//! The live Q histogram: accumulation, instrument changes and peak search.

use std::sync::{Arc, Mutex};

use qspace_algorithms::{find_histogram_peaks, integrate_peaks_histogram, PeakFinderConfig, SphereConfig};
use qspace_core::{Histogram3D, MillerIndex, OrientationMatrix, Peak, QEventBatch};
use qspace_instrument::{Instrument, InstrumentCalibration};

use crate::message::{CalibrationSource, Message, MessageKind};
use crate::router::Handler;
use crate::shared::{InstrumentContext, PipelineState};
use crate::Result;

pub struct HistogramHandler {
    state: Arc<PipelineState>,
    num_bins: usize,
    use_weights: bool,
}

impl HistogramHandler {
    #[must_use]
    pub fn new(state: Arc<PipelineState>, num_bins: usize, use_weights: bool) -> Self {
        Self {
            state,
            num_bins,
            use_weights,
        }
    }

    fn accumulate(&self, events: &QEventBatch) {
        let added = self
            .state
            .with_histogram(|histogram| histogram.add_events(events, self.use_weights));
        if added < events.len() {
            log::debug!("{} events fell outside the histogram", events.len() - added);
        }
    }

    /// Validates everything first so a failure leaves the live state alone.
    fn set_instrument(&self, name: &str, source: &CalibrationSource) -> std::result::Result<Instrument, String> {
        let instrument: Instrument = name.parse().map_err(|err: qspace_instrument::Error| err.to_string())?;
        let calibration = match source {
            CalibrationSource::Loaded(calibration) => (**calibration).clone(),
            CalibrationSource::File(path) => InstrumentCalibration::from_file(path)
                .map_err(|err| format!("{}: {err}", path.display()))?,
        };
        if calibration.instrument() != instrument {
            return Err(format!(
                "calibration is for {}, not {instrument}",
                calibration.instrument()
            ));
        }
        let histogram = Histogram3D::cube(instrument.default_max_q(), self.num_bins)
            .map_err(|err| err.to_string())?;

        self.state
            .instrument
            .replace(Some(InstrumentContext::new(calibration)));
        self.state.histogram.replace(Mutex::new(histogram));
        log::info!(
            "instrument set to {instrument}: |Q| < {}, {} bins per axis",
            instrument.default_max_q(),
            self.num_bins
        );
        Ok(instrument)
    }

    fn find_peaks(&self, config: &PeakFinderConfig) -> Vec<Peak> {
        let mut peaks = self
            .state
            .with_histogram(|histogram| find_histogram_peaks(histogram, config));
        if let Some(orientation) = *self.state.orientation.load() {
            index_peaks(&mut peaks, &orientation);
        }
        log::info!("found {} peaks", peaks.len());
        peaks
    }

    fn integrate_peaks(&self, config: &SphereConfig) -> Vec<Peak> {
        let mut peaks = self.state.peaks();
        if let Some(orientation) = *self.state.orientation.load() {
            index_peaks(&mut peaks, &orientation);
        }
        let integrated = self
            .state
            .with_histogram(|histogram| integrate_peaks_histogram(&mut peaks, histogram, config));
        log::info!("integrated {integrated} of {} peaks", peaks.len());
        peaks
    }
}

/// Gives every unindexed peak the nearest hkl; peaks at the origin stay
/// unindexed.
pub fn index_peaks(peaks: &mut [Peak], orientation: &OrientationMatrix) {
    for peak in peaks.iter_mut().filter(|p| !p.is_indexed()) {
        let hkl = MillerIndex::round(orientation.hkl_of(peak.q));
        if !hkl.is_origin() {
            peak.hkl = Some(hkl);
        }
    }
}

impl Handler for HistogramHandler {
    fn name(&self) -> &'static str {
        "histogram"
    }

    fn kinds(&self) -> &'static [MessageKind] {
        &[
            MessageKind::AddEventsToHistograms,
            MessageKind::ClearHistogram,
            MessageKind::SetNewInstrument,
            MessageKind::SetWeightsFromHistogram,
            MessageKind::FindPeaks,
            MessageKind::IntegratePeaks,
            MessageKind::GetHistogramMax,
        ]
    }

    fn handle(&mut self, message: &Message, out: &mut Vec<Message>) -> Result<()> {
        match message {
            Message::AddEventsToHistograms(events) => self.accumulate(events),
            Message::ClearHistogram => self.state.with_histogram(Histogram3D::clear),
            Message::SetNewInstrument { name, calibration } => {
                match self.set_instrument(name, calibration) {
                    Ok(instrument) => out.push(Message::InstrumentReady(instrument)),
                    Err(reason) => {
                        log::warn!("instrument change rejected: {reason}");
                        out.push(Message::LoadFailed(reason));
                    }
                }
            }
            Message::SetWeightsFromHistogram(events) => {
                let weighted = self.state.with_histogram(|histogram| {
                    let mut weighted = QEventBatch::with_capacity(events.len());
                    for (q, _) in events.iter() {
                        weighted.push_weighted(q, histogram.value_at(q));
                    }
                    weighted
                });
                out.push(Message::WeightedEvents(weighted));
            }
            Message::FindPeaks(config) => {
                let peaks = self.find_peaks(config);
                self.state.set_peaks(peaks.clone());
                out.push(Message::SetPeakQList(peaks));
            }
            Message::IntegratePeaks(config) => {
                let peaks = self.integrate_peaks(config);
                self.state.set_peaks(peaks.clone());
                out.push(Message::SetPeakQList(peaks));
            }
            Message::GetHistogramMax => {
                let (_, max) = self.state.with_histogram(|histogram| histogram.min_max());
                out.push(Message::SetHistogramMax(max));
            }
            _ => {}
        }
        Ok(())
    }
}
