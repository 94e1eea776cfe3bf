//! Event file loading.

use qspace_io::{FileEventLoader, LoaderConfig};

use crate::message::{Message, MessageKind};
use crate::router::Handler;
use crate::Result;

/// Loads `LoadFileData` requests and forwards one `MapEventsToQ` per segment
/// as each arrives, then emits `LoadDone`.
///
/// Each segment is mapped and accumulated before the loader hands over the
/// next, so only one raw segment is held at a time. An unreadable file or an
/// aborted load ends with `LoadFailed`; segments forwarded before the failure
/// stay in the histogram.
pub struct FileLoadHandler {
    config: LoaderConfig,
}

impl FileLoadHandler {
    #[must_use]
    pub fn new(config: LoaderConfig) -> Self {
        Self { config }
    }
}

impl Handler for FileLoadHandler {
    fn name(&self) -> &'static str {
        "file-load"
    }

    fn kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::LoadFileData]
    }

    fn handle(&mut self, message: &Message, out: &mut Vec<Message>) -> Result<()> {
        let mut segments = Vec::new();
        self.handle_forwarding(message, out, &mut |segment| segments.push(segment))?;
        out.splice(0..0, segments);
        Ok(())
    }

    fn handle_forwarding(
        &mut self,
        message: &Message,
        out: &mut Vec<Message>,
        forward: &mut dyn FnMut(Message),
    ) -> Result<()> {
        let Message::LoadFileData { path, request } = message else {
            return Ok(());
        };
        let loader = match FileEventLoader::open(path, self.config.clone()) {
            Ok(loader) => loader,
            Err(err) => {
                log::error!("cannot open {}: {err}", path.display());
                out.push(Message::LoadFailed(format!("{}: {err}", path.display())));
                return Ok(());
            }
        };

        let result = loader.load(*request, |segment| {
            log::trace!("forwarding {} events from {}", segment.events.len(), segment.first_event);
            forward(Message::MapEventsToQ(segment.events));
        });
        match result {
            Ok(summary) => {
                out.push(Message::Status(format!(
                    "loaded {} events from {}",
                    summary.loaded,
                    path.display()
                )));
                out.push(Message::LoadDone(summary));
            }
            Err(err) => {
                out.push(Message::Error(err.to_string()));
                out.push(Message::LoadFailed(format!("{}: {err}", path.display())));
            }
        }
        Ok(())
    }
}
