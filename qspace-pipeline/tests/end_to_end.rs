#![allow(clippy::uninlined_format_args)]
use std::sync::{Arc, Mutex};

use approx::assert_relative_eq;
use qspace_algorithms::QuickIntegrateConfig;
use qspace_core::{Mat3, MillerIndex, Peak, RawEventBatch, Vec3};
use qspace_instrument::{DetectorGrid, Instrument, InstrumentCalibration};
use qspace_io::{EventFileWriter, LoadRequest, LoaderConfig, PeaksFile};
use qspace_pipeline::{
    CalibrationSource, Handler, Message, MessageKind, Pipeline, PipelineConfig, PipelineState,
};

/// One pixel straight up at 0.5 m.
fn calibration() -> InstrumentCalibration {
    let grid = DetectorGrid::new(1, 1, 1, 0.01, 0.01, Vec3::Y * 0.5, Vec3::X, Vec3::Z).unwrap();
    InstrumentCalibration::new(Instrument::Topaz, 18.0, 0.0, vec![grid]).unwrap()
}

fn pipeline_with_topaz() -> Pipeline {
    pipeline_with_topaz_config(PipelineConfig::default())
}

fn pipeline_with_topaz_config(config: PipelineConfig) -> Pipeline {
    let config = config
        .with_num_bins(1)
        .with_quick_integrate(QuickIntegrateConfig::default().with_max_q(2.0).with_max_index(2));
    let mut pipeline = Pipeline::new(config).unwrap();
    pipeline.post(Message::SetNewInstrument {
        name: "TOPAZ".to_string(),
        calibration: CalibrationSource::Loaded(Box::new(calibration())),
    });
    pipeline.process_pending();
    assert!(pipeline.state().instrument.load().is_some());
    pipeline
}

#[test]
fn test_file_to_histogram() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.events");
    write_events(&path, 10);

    let mut pipeline = pipeline_with_topaz();
    let done = pipeline.tap(&[MessageKind::LoadDone, MessageKind::LoadFailed, MessageKind::Error]);
    pipeline.post(Message::LoadFileData {
        path: path.clone(),
        request: LoadRequest::new(0, 100, 100).with_worker_count(2),
    });
    pipeline.process_pending();

    let messages: Vec<Message> = done.try_iter().collect();
    assert!(
        matches!(&messages[..], [Message::LoadDone(summary)] if summary.loaded == 10),
        "unexpected messages: {:?}",
        messages
    );
    assert_relative_eq!(pipeline.state().with_histogram(|h| h.total()), 10.0);

    let profiles = pipeline.tap(&[MessageKind::SetQValues]);
    pipeline.post(Message::GetQValues { weighted: false });
    pipeline.process_pending();
    let Ok(Message::SetQValues(profile)) = profiles.try_recv() else {
        panic!("no |Q| profile");
    };
    assert_relative_eq!(profile.y.iter().sum::<f64>(), 10.0);

    pipeline.post(Message::ClearHistogram);
    pipeline.process_pending();
    assert_relative_eq!(pipeline.state().with_histogram(|h| h.total()), 0.0);
}

fn write_events(path: &std::path::Path, count: usize) {
    let mut batch = RawEventBatch::default();
    for _ in 0..count {
        batch.push(100_000, 1);
    }
    let mut writer = EventFileWriter::create(path).unwrap();
    writer.write_batch(&batch).unwrap();
    writer.finish().unwrap();
}

/// Records the segment size and the histogram total as each raw segment
/// reaches the mapper stage.
struct SegmentWatch {
    state: Arc<PipelineState>,
    seen: Arc<Mutex<Vec<(usize, f64)>>>,
}

impl Handler for SegmentWatch {
    fn name(&self) -> &'static str {
        "segment-watch"
    }

    fn kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::MapEventsToQ]
    }

    fn handle(&mut self, message: &Message, _out: &mut Vec<Message>) -> qspace_pipeline::Result<()> {
        if let Message::MapEventsToQ(batch) = message {
            let total = self.state.with_histogram(|h| h.total());
            self.seen.lock().unwrap().push((batch.len(), total));
        }
        Ok(())
    }
}

#[test]
fn test_segments_are_accumulated_one_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.events");
    write_events(&path, 10);

    let config =
        PipelineConfig::default().with_loader(LoaderConfig::default().with_max_segment_events(2));
    let mut pipeline = pipeline_with_topaz_config(config);
    let seen = Arc::new(Mutex::new(Vec::new()));
    pipeline.register(Box::new(SegmentWatch {
        state: Arc::clone(pipeline.state()),
        seen: Arc::clone(&seen),
    }));
    let done = pipeline.tap(&[MessageKind::LoadDone]);
    pipeline.post(Message::LoadFileData {
        path,
        request: LoadRequest::new(0, 10, 10).with_worker_count(2),
    });
    pipeline.process_pending();

    // every earlier segment was already in the histogram when the next
    // raw segment arrived
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 5, "segments: {:?}", seen);
    for (i, (len, total)) in seen.iter().enumerate() {
        assert_eq!(*len, 2);
        assert_relative_eq!(*total, 2.0 * i as f64);
    }
    assert!(matches!(done.try_recv(), Ok(Message::LoadDone(summary)) if summary.segments == 5));
    assert_relative_eq!(pipeline.state().with_histogram(|h| h.total()), 10.0);
}

#[test]
fn test_missing_file_fails_load() {
    let mut pipeline = pipeline_with_topaz();
    let failed = pipeline.tap(&[MessageKind::LoadFailed]);
    pipeline.post(Message::LoadFileData {
        path: "/nonexistent/run.events".into(),
        request: LoadRequest::new(0, 10, 10),
    });
    pipeline.process_pending();
    assert!(matches!(failed.try_recv(), Ok(Message::LoadFailed(_))));
}

#[test]
fn test_events_before_instrument_are_reported() {
    let mut pipeline = Pipeline::new(PipelineConfig::default().with_num_bins(1)).unwrap();
    let errors = pipeline.tap(&[MessageKind::Error]);
    let mut batch = RawEventBatch::default();
    batch.push(100_000, 1);
    pipeline.post(Message::MapEventsToQ(batch));
    pipeline.process_pending();
    assert!(matches!(errors.try_recv(), Ok(Message::Error(text)) if text.contains("no instrument")));
}

#[test]
fn test_orientation_and_peak_file() {
    let mut pipeline = pipeline_with_topaz();
    let replies = pipeline.tap(&[
        MessageKind::LoadFailed,
        MessageKind::Status,
        MessageKind::IntegrationResults,
    ]);

    pipeline.post(Message::SetOrientationMatrix(Mat3::new([[0.0; 3]; 3])));
    pipeline.process_pending();
    assert!(matches!(replies.try_recv(), Ok(Message::LoadFailed(_))));
    assert!(pipeline.state().orientation.load().is_none());

    pipeline.post(Message::SetOrientationMatrix(Mat3::identity().scaled(0.2)));
    pipeline.post(Message::QuickIntegrate);
    pipeline.process_pending();
    assert!(matches!(replies.try_recv(), Ok(Message::Status(_))));
    assert!(matches!(replies.try_recv(), Ok(Message::IntegrationResults(_))));

    let mut peak = Peak::on_detector(1, 1.0, 1.0, 20.0);
    peak.seqn = 1;
    peak.hkl = Some(MillerIndex::new(1, 0, 0));
    peak.wavelength = 2.0;
    peak.set_intensity(100.0, 10.0);
    pipeline.state().set_peaks(vec![peak]);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.peaks");
    pipeline.post(Message::WritePeakFile(path.clone()));
    pipeline.process_pending();
    assert!(matches!(replies.try_recv(), Ok(Message::Status(text)) if text.contains("1 peaks")));

    let back = PeaksFile::read(&path).unwrap();
    assert_eq!(back.instrument, "TOPAZ");
    assert_eq!(back.peaks.len(), 1);
    assert_eq!(back.peaks[0].hkl, Some(MillerIndex::new(1, 0, 0)));
}
