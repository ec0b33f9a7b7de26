//! Application-level signals.
//!
//! Explicit observer lists owned by the application instance: `ready`
//! (carries the bound listener address), `closed`, and `error` (carries any
//! error that reached the top level uncaught by a route error boundary).
//! Observers are registered before `run()`; nothing fires after `closed`.

use crate::error::EnsembleError;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Payload of the `ready` signal.
#[derive(Clone, Copy, Debug)]
pub struct ReadyInfo {
    /// Address the HTTP listener is bound to.
    pub addr: SocketAddr,
}

type ReadyObserver = Box<dyn Fn(&ReadyInfo) + Send + Sync>;
type ClosedObserver = Box<dyn Fn() + Send + Sync>;
type ErrorObserver = Box<dyn Fn(&EnsembleError) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Signals {
    ready: Mutex<Vec<ReadyObserver>>,
    closed: Mutex<Vec<ClosedObserver>>,
    error: Mutex<Vec<ErrorObserver>>,
    finished: AtomicBool,
}

impl Signals {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn on_ready(&self, f: impl Fn(&ReadyInfo) + Send + Sync + 'static) {
        self.ready.lock().unwrap().push(Box::new(f));
    }

    pub(crate) fn on_closed(&self, f: impl Fn() + Send + Sync + 'static) {
        self.closed.lock().unwrap().push(Box::new(f));
    }

    pub(crate) fn on_error(&self, f: impl Fn(&EnsembleError) + Send + Sync + 'static) {
        self.error.lock().unwrap().push(Box::new(f));
    }

    pub(crate) fn emit_ready(&self, info: &ReadyInfo) {
        if self.finished.load(Ordering::SeqCst) {
            return;
        }
        for observer in self.ready.lock().unwrap().iter() {
            observer(info);
        }
    }

    pub(crate) fn emit_error(&self, error: &EnsembleError) {
        if self.finished.load(Ordering::SeqCst) {
            return;
        }
        for observer in self.error.lock().unwrap().iter() {
            observer(error);
        }
    }

    /// Fires `closed` once; every signal is inert afterwards.
    pub(crate) fn emit_closed(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        for observer in self.closed.lock().unwrap().iter() {
            observer();
        }
    }
}
