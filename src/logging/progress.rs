//! Hierarchical progress tracking
//!
//! A root [`Allocation`] is sized to the number of pipeline steps; every step takes one unit
//! of its parent and splits it into its own units (bytes transferred, layers processed).
//! Progress is therefore always expressible as a fraction of the whole build.

use crate::logging::{BuilderEvent, Logger};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Default coalescing window for high-frequency byte counts
pub const DEFAULT_THROTTLE_DELAY: Duration = Duration::from_millis(100);

/// One node of the progress tree
#[derive(Debug)]
pub struct Allocation {
    description: String,
    allocation_units: u64,
    parent: Option<Arc<Allocation>>,
    fraction_of_root: f64,
}

impl Allocation {
    pub fn new_root(description: impl Into<String>, allocation_units: u64) -> Arc<Self> {
        Arc::new(Self {
            description: description.into(),
            allocation_units: allocation_units.max(1),
            parent: None,
            fraction_of_root: 1.0,
        })
    }

    /// A child occupying exactly one unit of `self`
    pub fn new_child(self: &Arc<Self>, description: impl Into<String>, allocation_units: u64) -> Arc<Self> {
        Arc::new(Self {
            description: description.into(),
            allocation_units: allocation_units.max(1),
            parent: Some(self.clone()),
            fraction_of_root: self.fraction_of_root / self.allocation_units as f64,
        })
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn allocation_units(&self) -> u64 {
        self.allocation_units
    }

    pub fn parent(&self) -> Option<&Arc<Allocation>> {
        self.parent.as_ref()
    }

    /// Share of the whole build this allocation represents
    pub fn fraction_of_root(&self) -> f64 {
        self.fraction_of_root
    }
}

/// `units` of `allocation` have completed
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub allocation: Arc<Allocation>,
    pub units: u64,
}

impl ProgressEvent {
    /// Completed share of the whole build carried by this event
    pub fn fraction_of_root(&self) -> f64 {
        self.units as f64 * self.allocation.fraction_of_root() / self.allocation.allocation_units() as f64
    }
}

/// Emits progress events for one allocation and never over-reports it
///
/// Creating a child consumes one unit; closing (or dropping) the dispatcher reports
/// whatever units are still outstanding.
#[derive(Debug)]
pub struct ProgressEventDispatcher {
    logger: Logger,
    allocation: Arc<Allocation>,
    remaining: Mutex<u64>,
}

impl ProgressEventDispatcher {
    pub fn new_root(logger: &Logger, description: impl Into<String>, allocation_units: u64) -> Self {
        Self::start(logger.clone(), Allocation::new_root(description, allocation_units))
    }

    pub fn new_child(&self, description: impl Into<String>, allocation_units: u64) -> Self {
        self.decrement(1);
        Self::start(
            self.logger.clone(),
            self.allocation.new_child(description, allocation_units),
        )
    }

    fn start(logger: Logger, allocation: Arc<Allocation>) -> Self {
        let remaining = allocation.allocation_units();
        let dispatcher = Self {
            logger,
            allocation,
            remaining: Mutex::new(remaining),
        };
        dispatcher.emit(0);
        dispatcher
    }

    pub fn allocation(&self) -> &Arc<Allocation> {
        &self.allocation
    }

    pub fn dispatch_progress(&self, units: u64) {
        let units = self.decrement(units);
        if units > 0 {
            self.emit(units);
        }
    }

    pub fn close(&self) {
        let outstanding = {
            let mut remaining = self.remaining.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *remaining)
        };
        if outstanding > 0 {
            self.emit(outstanding);
        }
    }

    /// Returns how many of the requested units were still available
    fn decrement(&self, units: u64) -> u64 {
        let mut remaining = self.remaining.lock().unwrap_or_else(|e| e.into_inner());
        let taken = units.min(*remaining);
        *remaining -= taken;
        taken
    }

    fn emit(&self, units: u64) {
        self.logger.dispatch(BuilderEvent::Progress(ProgressEvent {
            allocation: self.allocation.clone(),
            units,
        }));
    }
}

impl Drop for ProgressEventDispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

/// Coalesces frequent progress counts into at most one callback per window
pub struct ThrottledProgressListener {
    callback: Box<dyn Fn(u64) + Send + Sync>,
    delay: Duration,
    state: Mutex<ThrottleState>,
}

struct ThrottleState {
    accumulated: u64,
    last_flush: Instant,
}

impl ThrottledProgressListener {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        Self::with_delay(callback, DEFAULT_THROTTLE_DELAY)
    }

    pub fn with_delay<F>(callback: F, delay: Duration) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        Self {
            callback: Box::new(callback),
            delay,
            state: Mutex::new(ThrottleState {
                accumulated: 0,
                last_flush: Instant::now(),
            }),
        }
    }

    pub fn accept(&self, units: u64) {
        let flushed = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.accumulated += units;
            if state.last_flush.elapsed() >= self.delay {
                state.last_flush = Instant::now();
                Some(std::mem::take(&mut state.accumulated))
            } else {
                None
            }
        };
        if let Some(units) = flushed.filter(|units| *units > 0) {
            (self.callback)(units);
        }
    }

    pub fn flush(&self) {
        let units = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.last_flush = Instant::now();
            std::mem::take(&mut state.accumulated)
        };
        if units > 0 {
            (self.callback)(units);
        }
    }
}

impl Drop for ThrottledProgressListener {
    fn drop(&mut self) {
        self.flush();
    }
}
