//! Raw events to Q.

use std::sync::Arc;

use qspace_algorithms::{EventMapper, MapperConfig};

use crate::message::{Message, MessageKind};
use crate::router::Handler;
use crate::shared::PipelineState;
use crate::{Error, Result};

/// Maps every `MapEventsToQ` batch with the active instrument and forwards
/// each successful sub-range as `AddEventsToHistograms`.
///
/// A failed sub-range is reported as an `Error` message; the others are
/// still forwarded.
pub struct MapperHandler {
    state: Arc<PipelineState>,
    config: MapperConfig,
}

impl MapperHandler {
    #[must_use]
    pub fn new(state: Arc<PipelineState>, config: MapperConfig) -> Self {
        Self { state, config }
    }
}

impl Handler for MapperHandler {
    fn name(&self) -> &'static str {
        "mapper"
    }

    fn kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::MapEventsToQ]
    }

    fn handle(&mut self, message: &Message, out: &mut Vec<Message>) -> Result<()> {
        let Message::MapEventsToQ(batch) = message else {
            return Ok(());
        };
        let instrument = self.state.instrument.load();
        let Some(context) = &*instrument else {
            return Err(Error::NoInstrument);
        };

        let mapper = EventMapper::new(Arc::clone(&context.q_map), self.config.clone());
        let outcome = mapper.map(batch);
        for (index, err) in &outcome.errors {
            out.push(Message::Error(format!("mapping sub-range {index}: {err}")));
        }
        if outcome.num_skipped() > 0 {
            log::debug!("skipped {} events with unknown pixel ids", outcome.num_skipped());
        }
        for mapped in outcome.batches {
            if !mapped.events.is_empty() {
                out.push(Message::AddEventsToHistograms(mapped.events));
            }
        }
        Ok(())
    }
}
