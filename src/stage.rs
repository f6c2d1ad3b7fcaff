use std::marker::PhantomData;
use std::time::Instant;
use tracing::debug;

use crate::error::{PlumbingError, Result};
use crate::metrics::StageMetrics;
use crate::stream::{Stream, Tuple};

/// An inline processing stage.
///
/// A stage consumes one tuple and produces at most one. It runs on the thread
/// that delivers the tuple; see [`Stream::pipe`].
pub trait Stage<I, O>: Send + 'static {
    /// Process an input tuple. `None` drops it.
    fn process(&mut self, input: I) -> Result<Option<O>>;

    /// Get a human-readable name for this stage
    fn name(&self) -> &str {
        "stage"
    }
}

/// A mapping stage that transforms each tuple
#[derive(Debug)]
pub struct MapStage<F> {
    name: String,
    mapper: F,
}

impl<F> MapStage<F> {
    /// Create a new map stage
    pub fn new(name: impl Into<String>, mapper: F) -> Self {
        Self {
            name: name.into(),
            mapper,
        }
    }
}

impl<I, O, F> Stage<I, O> for MapStage<F>
where
    F: FnMut(I) -> Result<O> + Send + 'static,
{
    fn process(&mut self, input: I) -> Result<Option<O>> {
        Ok(Some((self.mapper)(input)?))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A filtering stage that passes through tuples matching a predicate
#[derive(Debug)]
pub struct FilterStage<F> {
    name: String,
    predicate: F,
}

impl<F> FilterStage<F> {
    /// Create a new filter stage
    pub fn new(name: impl Into<String>, predicate: F) -> Self {
        Self {
            name: name.into(),
            predicate,
        }
    }
}

impl<T, F> Stage<T, T> for FilterStage<F>
where
    F: FnMut(&T) -> bool + Send + 'static,
{
    fn process(&mut self, input: T) -> Result<Option<T>> {
        if (self.predicate)(&input) {
            Ok(Some(input))
        } else {
            Ok(None)
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Where an isolating stage's worker takes its next tuple from
pub(crate) trait Drain<T>: Send + Sync + 'static {
    /// Wait for the next tuple. [`PlumbingError::Closed`] ends the worker.
    fn take(&self) -> Result<T>;
}

/// Runs one worker of an isolating stage: pulls from the stage's input and
/// emits downstream on the worker's own thread
pub(crate) struct StageRunner<D, T> {
    name: String,
    input: D,
    output: Stream<T>,
    metrics: StageMetrics,
    _tuple: PhantomData<fn() -> T>,
}

impl<D, T> StageRunner<D, T>
where
    D: Drain<T>,
    T: Tuple,
{
    pub(crate) fn new(
        name: impl Into<String>,
        input: D,
        output: Stream<T>,
        metrics: StageMetrics,
    ) -> Self {
        Self {
            name: name.into(),
            input,
            output,
            metrics,
            _tuple: PhantomData,
        }
    }

    /// Forward tuples until the input closes or delivery fails
    pub(crate) fn run(self) -> Result<()> {
        debug!(stage = %self.name, "stage runner started");
        loop {
            let tuple = match self.input.take() {
                Ok(tuple) => tuple,
                Err(PlumbingError::Closed) => {
                    debug!(stage = %self.name, "stage input closed");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            let start = Instant::now();
            self.output.emit(tuple)?;
            self.metrics.record_forwarded(start.elapsed());
        }
    }
}
