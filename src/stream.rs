//! Push-based streams.
//!
//! A [`Stream`] is a handle on an output port. Subscribing to it attaches a
//! handler that runs on whichever thread emits into the port, so inline
//! operators (`map`, `filter`, `pipe`, the pacing stages) execute on the
//! producer's thread until an isolating stage hands the tuple to a worker.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::debug;

use crate::error::{PlumbingError, Result};
use crate::stage::{FilterStage, MapStage, Stage};
use crate::topology::Topology;

/// Bound shared by every tuple type.
///
/// `Clone` lets a stream with several subscribers hand each one its own copy.
pub trait Tuple: Clone + Send + 'static {}

impl<T: Clone + Send + 'static> Tuple for T {}

type Handler<T> = Arc<dyn Fn(T) -> Result<()> + Send + Sync>;

struct Port<T> {
    subscribers: RwLock<Arc<Vec<Handler<T>>>>,
}

impl<T: Tuple> Port<T> {
    fn new() -> Self {
        Self {
            subscribers: RwLock::new(Arc::new(Vec::new())),
        }
    }

    fn subscribe(&self, handler: Handler<T>) {
        let mut subscribers = self.subscribers.write();
        let mut next = Vec::with_capacity(subscribers.len() + 1);
        next.extend(subscribers.iter().cloned());
        next.push(handler);
        *subscribers = Arc::new(next);
    }

    fn emit(&self, tuple: T) -> Result<()> {
        // Snapshot so a blocked subscriber never holds the lock.
        let subscribers = Arc::clone(&self.subscribers.read());
        match subscribers.split_last() {
            None => Ok(()),
            Some((last, rest)) => {
                for handler in rest {
                    handler(tuple.clone())?;
                }
                last(tuple)
            }
        }
    }
}

/// A stream of tuples produced by one stage of a [`Topology`].
pub struct Stream<T> {
    port: Arc<Port<T>>,
    topology: Topology,
    tag: Option<Arc<str>>,
}

impl<T> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Self {
            port: Arc::clone(&self.port),
            topology: self.topology.clone(),
            tag: self.tag.clone(),
        }
    }
}

impl<T: Tuple> Stream<T> {
    pub(crate) fn new(topology: Topology) -> Self {
        Self {
            port: Arc::new(Port::new()),
            topology,
            tag: None,
        }
    }

    /// The topology this stream belongs to
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Label the stream. Stages wired downstream use the tag in their names.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(Arc::from(tag.into()));
        self
    }

    /// The label set by [`Stream::tag`], if any
    pub fn tag_name(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub(crate) fn subscribe<F>(&self, handler: F)
    where
        F: Fn(T) -> Result<()> + Send + Sync + 'static,
    {
        self.port.subscribe(Arc::new(handler));
    }

    /// Deliver a tuple to every subscriber on the calling thread
    pub(crate) fn emit(&self, tuple: T) -> Result<()> {
        self.port.emit(tuple)
    }

    /// Transform every tuple
    pub fn map<U, F>(&self, mapper: F) -> Stream<U>
    where
        U: Tuple,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let output = Stream::new(self.topology.clone());
        let downstream = output.clone();
        self.subscribe(move |tuple| downstream.emit(mapper(tuple)));
        output
    }

    /// Transform every tuple with a fallible function.
    ///
    /// An error fails the delivery of that tuple and is returned to the thread
    /// that emitted it.
    pub fn try_map<U, F>(&self, mapper: F) -> Stream<U>
    where
        U: Tuple,
        F: Fn(T) -> Result<U> + Send + Sync + 'static,
    {
        self.pipe(MapStage::new("try_map", mapper))
    }

    /// Keep only tuples matching a predicate
    pub fn filter<F>(&self, predicate: F) -> Stream<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.pipe(FilterStage::new("filter", predicate))
    }

    /// Attach an inline stage.
    ///
    /// The stage runs on the emitting thread, serialized by a per-stage lock,
    /// so its `&mut self` state is never touched concurrently.
    pub fn pipe<U, S>(&self, stage: S) -> Stream<U>
    where
        U: Tuple,
        S: Stage<T, U>,
    {
        debug!(stage = stage.name(), "wiring inline stage");
        let output = Stream::new(self.topology.clone());
        let downstream = output.clone();
        let stage = Mutex::new(stage);
        self.subscribe(move |tuple| {
            let result = stage.lock().process(tuple)?;
            match result {
                Some(out) => downstream.emit(out),
                None => Ok(()),
            }
        });
        output
    }

    /// Terminate the stream in a consumer function
    pub fn sink<F>(&self, consumer: F)
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.subscribe(move |tuple| {
            consumer(tuple);
            Ok(())
        });
    }
}

/// Submits tuples into a source stream on the caller's thread.
///
/// The tuple runs through every inline stage up to the first isolating stage
/// before `submit` returns, and `submit` blocks when that stage's queue is
/// full.
pub struct Publisher<T> {
    stream: Stream<T>,
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
        }
    }
}

impl<T: Tuple> Publisher<T> {
    pub(crate) fn new(stream: Stream<T>) -> Self {
        Self { stream }
    }

    /// Push one tuple into the topology
    pub fn submit(&self, tuple: T) -> Result<()> {
        if self.stream.topology().is_shutdown() {
            return Err(PlumbingError::Closed);
        }
        self.stream.emit(tuple)
    }
}
