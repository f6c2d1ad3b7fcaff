use crossbeam::channel::{bounded, select, Receiver, Sender, TrySendError};
use tracing::warn;

use crate::error::{PlumbingError, Result};
use crate::metrics::StageMetrics;
use crate::signal::ShutdownSignal;
use crate::stage::Drain;

/// Something a topology can close on teardown
pub trait Close: Send + Sync {
    /// Wake every blocked producer and consumer and release buffered tuples
    fn close(&self);
}

/// A fixed-capacity, closable queue between one producer stage and one or
/// more consumer workers.
///
/// Pushing into a full queue blocks; popping from an empty queue blocks. Both
/// fail with [`PlumbingError::Closed`] once the queue is closed.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
    closed: ShutdownSignal,
    metrics: StageMetrics,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            capacity: self.capacity,
            closed: self.closed.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<T: Send> BoundedQueue<T> {
    /// Create a new queue holding up to `capacity` items.
    ///
    /// A capacity of 0 is treated as 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            warn!("queue capacity 0 is invalid, using 1");
            1
        } else {
            capacity
        };
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            closed: ShutdownSignal::new(),
            metrics: StageMetrics::new(),
        }
    }

    /// Push an item, waiting while the queue is full
    pub fn push(&self, item: T) -> Result<()> {
        if self.closed.is_fired() {
            return Err(PlumbingError::Closed);
        }
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Disconnected(_)) => Err(PlumbingError::Closed),
            Err(TrySendError::Full(item)) => {
                self.metrics.record_blocked();
                select! {
                    send(self.tx, item) -> res => res.map_err(|_| PlumbingError::Closed),
                    recv(self.closed.listener()) -> _ => Err(PlumbingError::Closed),
                }
            }
        }
    }

    /// Pop the oldest item, waiting until one is available or the queue closes
    pub fn pop(&self) -> Result<T> {
        if self.closed.is_fired() {
            return Err(PlumbingError::Closed);
        }
        select! {
            recv(self.rx) -> msg => msg.map_err(|_| PlumbingError::Closed),
            recv(self.closed.listener()) -> _ => Err(PlumbingError::Closed),
        }
    }

    /// Get the current size of the queue
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Get the capacity of the queue
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Counters shared by every clone of this queue
    pub fn metrics(&self) -> StageMetrics {
        self.metrics.clone()
    }
}

impl<T: Send + 'static> Drain<T> for BoundedQueue<T> {
    fn take(&self) -> Result<T> {
        self.pop()
    }
}

impl<T: Send> Close for BoundedQueue<T> {
    fn close(&self) {
        self.closed.fire();
        while self.rx.try_recv().is_ok() {}
    }
}
