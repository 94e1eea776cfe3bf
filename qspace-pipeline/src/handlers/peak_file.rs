//! Peak file output.

use std::sync::Arc;

use qspace_io::PeaksFile;

use crate::message::{Message, MessageKind};
use crate::router::Handler;
use crate::shared::PipelineState;
use crate::{Error, Result};

/// Writes the current peak list with the active instrument geometry.
pub struct PeakFileHandler {
    state: Arc<PipelineState>,
}

impl PeakFileHandler {
    #[must_use]
    pub fn new(state: Arc<PipelineState>) -> Self {
        Self { state }
    }
}

impl Handler for PeakFileHandler {
    fn name(&self) -> &'static str {
        "peak-file"
    }

    fn kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::WritePeakFile]
    }

    fn handle(&mut self, message: &Message, out: &mut Vec<Message>) -> Result<()> {
        let Message::WritePeakFile(path) = message else {
            return Ok(());
        };
        let instrument = self.state.instrument.load();
        let Some(context) = &*instrument else {
            return Err(Error::NoInstrument);
        };
        let peaks = self.state.peaks();
        let count = peaks.iter().filter(|p| p.is_valid()).count();
        PeaksFile::from_calibration(&context.calibration, peaks).write(path)?;
        log::info!("wrote {count} peaks to {}", path.display());
        out.push(Message::Status(format!(
            "wrote {count} peaks to {}",
            path.display()
        )));
        Ok(())
    }
}
