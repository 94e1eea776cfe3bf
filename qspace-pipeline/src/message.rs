//! Pipeline message types.
//!
//! Every request and every result travelling through the pipeline is a
//! [`Message`]. The [`MessageKind`] tag is what handlers subscribe to.

use std::path::PathBuf;

use qspace_algorithms::{PeakFinderConfig, QuickIntegrateResults, SphereConfig};
use qspace_core::{Mat3, Peak, QEventBatch, RawEventBatch};
use qspace_instrument::{Instrument, InstrumentCalibration};
use qspace_io::{ListenerEvent, LoadRequest, LoadSummary};

/// Where the geometry for a new instrument comes from.
#[derive(Debug, Clone)]
pub enum CalibrationSource {
    Loaded(Box<InstrumentCalibration>),
    /// A JSON calibration file.
    File(PathBuf),
}

/// A one-dimensional profile: lower bin edges and values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Profile {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

/// Messages exchanged between pipeline stages.
#[derive(Debug, Clone)]
pub enum Message {
    /// Load part of an event file and feed it to the mapper.
    LoadFileData {
        path: PathBuf,
        request: LoadRequest,
    },
    MapEventsToQ(RawEventBatch),
    AddEventsToHistograms(QEventBatch),
    ClearHistogram,
    /// Rebuild the histogram and Q tables for a named instrument.
    SetNewInstrument {
        name: String,
        calibration: CalibrationSource,
    },
    FindPeaks(PeakFinderConfig),
    SetPeakQList(Vec<Peak>),
    /// Row-major UB matrix mapping hkl to Q/2π.
    SetOrientationMatrix(Mat3),
    GetHistogramMax,
    SetHistogramMax(f64),
    WritePeakFile(PathBuf),
    ScaleFactor(f64),
    /// Re-weight events by the live histogram density.
    SetWeightsFromHistogram(QEventBatch),
    WeightedEvents(QEventBatch),
    /// Sphere-integrate the current peak list on the live histogram.
    IntegratePeaks(SphereConfig),
    QuickIntegrate,
    IntegrationResults(QuickIntegrateResults),
    GetQValues { weighted: bool },
    SetQValues(Profile),
    GetDValues { weighted: bool },
    SetDValues(Profile),
    Status(String),
    Error(String),
    InstrumentReady(Instrument),
    LoadFailed(String),
    LoadDone(LoadSummary),
}

/// Tag of a [`Message`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    LoadFileData,
    MapEventsToQ,
    AddEventsToHistograms,
    ClearHistogram,
    SetNewInstrument,
    FindPeaks,
    SetPeakQList,
    SetOrientationMatrix,
    GetHistogramMax,
    SetHistogramMax,
    WritePeakFile,
    ScaleFactor,
    SetWeightsFromHistogram,
    WeightedEvents,
    IntegratePeaks,
    QuickIntegrate,
    IntegrationResults,
    GetQValues,
    SetQValues,
    GetDValues,
    SetDValues,
    Status,
    Error,
    InstrumentReady,
    LoadFailed,
    LoadDone,
}

impl Message {
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::LoadFileData { .. } => MessageKind::LoadFileData,
            Message::MapEventsToQ(_) => MessageKind::MapEventsToQ,
            Message::AddEventsToHistograms(_) => MessageKind::AddEventsToHistograms,
            Message::ClearHistogram => MessageKind::ClearHistogram,
            Message::SetNewInstrument { .. } => MessageKind::SetNewInstrument,
            Message::FindPeaks(_) => MessageKind::FindPeaks,
            Message::SetPeakQList(_) => MessageKind::SetPeakQList,
            Message::SetOrientationMatrix(_) => MessageKind::SetOrientationMatrix,
            Message::GetHistogramMax => MessageKind::GetHistogramMax,
            Message::SetHistogramMax(_) => MessageKind::SetHistogramMax,
            Message::WritePeakFile(_) => MessageKind::WritePeakFile,
            Message::ScaleFactor(_) => MessageKind::ScaleFactor,
            Message::SetWeightsFromHistogram(_) => MessageKind::SetWeightsFromHistogram,
            Message::WeightedEvents(_) => MessageKind::WeightedEvents,
            Message::IntegratePeaks(_) => MessageKind::IntegratePeaks,
            Message::QuickIntegrate => MessageKind::QuickIntegrate,
            Message::IntegrationResults(_) => MessageKind::IntegrationResults,
            Message::GetQValues { .. } => MessageKind::GetQValues,
            Message::SetQValues(_) => MessageKind::SetQValues,
            Message::GetDValues { .. } => MessageKind::GetDValues,
            Message::SetDValues(_) => MessageKind::SetDValues,
            Message::Status(_) => MessageKind::Status,
            Message::Error(_) => MessageKind::Error,
            Message::InstrumentReady(_) => MessageKind::InstrumentReady,
            Message::LoadFailed(_) => MessageKind::LoadFailed,
            Message::LoadDone(_) => MessageKind::LoadDone,
        }
    }
}

impl From<ListenerEvent> for Message {
    fn from(event: ListenerEvent) -> Self {
        match event {
            ListenerEvent::Events(batch) => Message::MapEventsToQ(batch),
            ListenerEvent::ScaleFactor(scale) => Message::ScaleFactor(scale),
        }
    }
}
