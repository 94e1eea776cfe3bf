//! The message queue and the loop that drains it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use qspace_algorithms::{MapperConfig, QuickIntegrateConfig};
use qspace_core::Histogram3D;
use qspace_io::LoaderConfig;

use crate::handlers::{
    DqHandler, FileLoadHandler, HistogramHandler, MapperHandler, PeakFileHandler,
    QuickIntegrateHandler,
};
use crate::message::{Message, MessageKind};
use crate::router::{Handler, Router};
use crate::shared::PipelineState;
use crate::{Error, Result};

/// Bins per axis of the live histogram.
pub const DEFAULT_NUM_BINS: usize = 256;
/// Half-width of the histogram before any instrument is set.
pub const DEFAULT_MAX_Q: f64 = 25.0;

/// Pipeline configuration.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub num_bins: usize,
    pub max_q: f64,
    /// Accumulate event weights instead of counts.
    pub use_weights: bool,
    pub mapper: MapperConfig,
    pub loader: LoaderConfig,
    pub quick_integrate: QuickIntegrateConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            num_bins: DEFAULT_NUM_BINS,
            max_q: DEFAULT_MAX_Q,
            use_weights: false,
            mapper: MapperConfig::default(),
            loader: LoaderConfig::default(),
            quick_integrate: QuickIntegrateConfig::default(),
        }
    }
}

impl PipelineConfig {
    #[must_use]
    pub fn with_num_bins(mut self, num_bins: usize) -> Self {
        self.num_bins = num_bins;
        self
    }

    #[must_use]
    pub fn with_max_q(mut self, max_q: f64) -> Self {
        self.max_q = max_q;
        self
    }

    #[must_use]
    pub fn with_use_weights(mut self, use_weights: bool) -> Self {
        self.use_weights = use_weights;
        self
    }

    #[must_use]
    pub fn with_mapper(mut self, mapper: MapperConfig) -> Self {
        self.mapper = mapper;
        self
    }

    #[must_use]
    pub fn with_loader(mut self, loader: LoaderConfig) -> Self {
        self.loader = loader;
        self
    }

    #[must_use]
    pub fn with_quick_integrate(mut self, quick_integrate: QuickIntegrateConfig) -> Self {
        self.quick_integrate = quick_integrate;
        self
    }
}

/// A single-consumer message queue with every handler registered.
///
/// Messages are processed strictly in the order they were posted. Follow-up
/// messages produced by a handler go to the back of the queue; messages it
/// forwards while running (file segments) are handled before it continues.
pub struct Pipeline {
    router: Router,
    sender: Sender<Message>,
    receiver: Receiver<Message>,
    state: Arc<PipelineState>,
}

impl Pipeline {
    /// Builds the shared state and registers the standard handlers.
    ///
    /// # Errors
    /// Returns an error if the initial histogram cannot be built.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        if config.num_bins == 0 {
            return Err(Error::InvalidConfig("num_bins must be positive".to_string()));
        }
        let histogram = Histogram3D::cube(config.max_q, config.num_bins)?;
        let state = Arc::new(PipelineState::new(histogram));
        let (sender, receiver) = channel();

        let mut router = Router::new();
        router.register(Box::new(FileLoadHandler::new(config.loader)));
        router.register(Box::new(MapperHandler::new(Arc::clone(&state), config.mapper)));
        router.register(Box::new(HistogramHandler::new(
            Arc::clone(&state),
            config.num_bins,
            config.use_weights,
        )));
        router.register(Box::new(QuickIntegrateHandler::new(
            Arc::clone(&state),
            config.quick_integrate,
        )));
        router.register(Box::new(DqHandler::new()));
        router.register(Box::new(PeakFileHandler::new(Arc::clone(&state))));

        Ok(Self {
            router,
            sender,
            receiver,
            state,
        })
    }

    /// A handle for posting messages from other threads.
    #[must_use]
    pub fn sender(&self) -> Sender<Message> {
        self.sender.clone()
    }

    #[must_use]
    pub fn state(&self) -> &Arc<PipelineState> {
        &self.state
    }

    /// Adds a custom stage after the standard ones.
    pub fn register(&mut self, handler: Box<dyn Handler>) {
        self.router.register(handler);
    }

    /// Subscribes to copies of dispatched messages, e.g. results and
    /// errors for a front end.
    pub fn tap(&mut self, kinds: &[MessageKind]) -> Receiver<Message> {
        self.router.tap(kinds)
    }

    pub fn post(&self, message: Message) {
        // the receiver lives in self, so the send cannot fail
        let _ = self.sender.send(message);
    }

    fn dispatch(&mut self, message: &Message) {
        for follow_up in self.router.dispatch(message) {
            let _ = self.sender.send(follow_up);
        }
    }

    /// Handles queued messages, including their follow-ups, until the queue
    /// is empty. Returns how many were handled.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        loop {
            match self.receiver.try_recv() {
                Ok(message) => {
                    self.dispatch(&message);
                    handled += 1;
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return handled,
            }
        }
    }

    /// Handles messages until `stop` is set, checking it at least every
    /// `poll`.
    pub fn run(&mut self, stop: &AtomicBool, poll: Duration) -> usize {
        let mut handled = 0;
        while !stop.load(Ordering::SeqCst) {
            match self.receiver.recv_timeout(poll) {
                Ok(message) => {
                    self.dispatch(&message);
                    handled += 1;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        log::debug!("pipeline stopped after {handled} messages");
        handled
    }
}
