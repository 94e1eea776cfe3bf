//! Replace-on-write shared state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use qspace_core::{Histogram3D, OrientationMatrix, Peak};
use qspace_instrument::{InstrumentCalibration, TofToQMap};

/// A value that is swapped as a whole, never edited in place.
///
/// Readers take an `Arc` snapshot and keep a consistent object for as long
/// as they hold it, even if a writer replaces the value meanwhile.
#[derive(Debug)]
pub struct Shared<T> {
    slot: RwLock<Arc<T>>,
    version: AtomicU64,
}

impl<T> Shared<T> {
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            slot: RwLock::new(Arc::new(value)),
            version: AtomicU64::new(0),
        }
    }

    /// Current value.
    #[must_use]
    pub fn load(&self) -> Arc<T> {
        Arc::clone(&self.slot.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Installs a new value and returns the previous one.
    pub fn replace(&self, value: T) -> Arc<T> {
        let value = Arc::new(value);
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        let old = std::mem::replace(&mut *slot, value);
        self.version.fetch_add(1, Ordering::SeqCst);
        old
    }

    /// Number of replacements so far.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}

/// Geometry of the active instrument.
#[derive(Debug)]
pub struct InstrumentContext {
    pub calibration: InstrumentCalibration,
    pub q_map: Arc<TofToQMap>,
}

impl InstrumentContext {
    #[must_use]
    pub fn new(calibration: InstrumentCalibration) -> Self {
        let q_map = Arc::new(TofToQMap::new(&calibration));
        Self { calibration, q_map }
    }
}

/// State shared by the pipeline handlers.
#[derive(Debug)]
pub struct PipelineState {
    pub instrument: Shared<Option<InstrumentContext>>,
    /// The live histogram. Accumulation and peak search both hold its
    /// mutex; an instrument change swaps in a new one.
    pub histogram: Shared<Mutex<Histogram3D>>,
    pub orientation: Shared<Option<OrientationMatrix>>,
    /// Most recent peak list.
    pub peaks: Mutex<Vec<Peak>>,
}

impl PipelineState {
    #[must_use]
    pub fn new(histogram: Histogram3D) -> Self {
        Self {
            instrument: Shared::new(None),
            histogram: Shared::new(Mutex::new(histogram)),
            orientation: Shared::new(None),
            peaks: Mutex::new(Vec::new()),
        }
    }

    /// Runs `f` with the live histogram locked.
    pub fn with_histogram<R>(&self, f: impl FnOnce(&mut Histogram3D) -> R) -> R {
        let histogram = self.histogram.load();
        let mut guard = histogram.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Snapshot of the current peak list.
    pub fn peaks(&self) -> Vec<Peak> {
        self.peaks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_peaks(&self, peaks: Vec<Peak>) {
        *self.peaks.lock().unwrap_or_else(PoisonError::into_inner) = peaks;
    }
}
