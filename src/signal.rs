use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{PlumbingError, Result};

/// A one-way, sticky close signal.
///
/// Firing drops the only sender of a zero-capacity channel, so every thread
/// parked on [`ShutdownSignal::listener`] in a `select!` or in
/// [`ShutdownSignal::sleep`] wakes at once. Once fired it stays fired.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    trigger: Mutex<Option<Sender<()>>>,
    listener: Receiver<()>,
    fired: AtomicBool,
}

impl ShutdownSignal {
    /// Create an unfired signal
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            inner: Arc::new(Inner {
                trigger: Mutex::new(Some(tx)),
                listener: rx,
                fired: AtomicBool::new(false),
            }),
        }
    }

    /// Fire the signal, waking every waiter. Idempotent.
    pub fn fire(&self) {
        self.inner.fired.store(true, Ordering::Release);
        self.inner.trigger.lock().take();
    }

    /// Whether the signal has been fired
    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    /// Receiver that becomes ready (disconnected) once the signal fires.
    ///
    /// Never yields a message; use it as a `select!` arm.
    pub fn listener(&self) -> &Receiver<()> {
        &self.inner.listener
    }

    /// Sleep for `duration` unless the signal fires first.
    ///
    /// Returns [`PlumbingError::Interrupted`] if the signal was already fired
    /// or fires during the sleep.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        if self.is_fired() {
            return Err(PlumbingError::Interrupted);
        }
        if duration.is_zero() {
            return Ok(());
        }
        match self.inner.listener.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => Ok(()),
            _ => Err(PlumbingError::Interrupted),
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
