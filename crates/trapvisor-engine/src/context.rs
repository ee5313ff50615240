use std::{
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use trapvisor_core::VmiError;

/// Receives errors that were handled internally but should still be
/// surfaced to the embedding application.
pub trait ErrorSink {
    /// Reports a single error.
    fn report(&self, error: &VmiError);
}

impl<F> ErrorSink for F
where
    F: Fn(&VmiError),
{
    fn report(&self, error: &VmiError) {
        self(error)
    }
}

/// State shared between the monitor loop, the dispatcher and the embedding
/// application.
///
/// The termination flag is an [`Arc<AtomicBool>`] so that it can be handed
/// to a signal handler (e.g. `signal_hook::flag::register`).
#[derive(Clone)]
pub struct MonitorContext {
    terminate: Arc<AtomicBool>,
    sink: Rc<dyn ErrorSink>,
}

impl MonitorContext {
    /// Creates a new context reporting errors to `sink`.
    pub fn new(sink: impl ErrorSink + 'static) -> Self {
        Self {
            terminate: Arc::new(AtomicBool::new(false)),
            sink: Rc::new(sink),
        }
    }

    /// Returns the termination flag.
    pub fn terminate_flag(&self) -> Arc<AtomicBool> {
        self.terminate.clone()
    }

    /// Asks the monitor loop to stop after the current event.
    pub fn request_stop(&self) {
        self.terminate.store(true, Ordering::Relaxed);
    }

    /// Returns `true` once a stop has been requested.
    pub fn should_stop(&self) -> bool {
        self.terminate.load(Ordering::Relaxed)
    }

    /// Forwards `error` to the error sink.
    pub fn report(&self, error: &VmiError) {
        self.sink.report(error);
    }
}

impl Default for MonitorContext {
    /// Creates a context that discards reported errors.
    fn default() -> Self {
        Self::new(|_: &VmiError| {})
    }
}

impl std::fmt::Debug for MonitorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorContext")
            .field("terminate", &self.should_stop())
            .finish_non_exhaustive()
    }
}
