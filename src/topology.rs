use crossbeam::channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::buffer::Close;
use crate::config::TopologyConfig;
use crate::error::{PlumbingError, Result};
use crate::metrics::StageMetrics;
use crate::signal::ShutdownSignal;
use crate::stream::{Publisher, Stream, Tuple};

/// A unit of work handed to a [`ThreadProvider`]
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Execution resources for stage workers.
///
/// Every isolating stage asks the provider for one logical thread per worker.
/// How those map onto physical threads is up to the provider; tasks block on
/// their queues, so a provider that multiplexes several tasks onto one thread
/// must be able to run all of them concurrently.
pub trait ThreadProvider: Send + Sync + 'static {
    /// Start running `task`. `name` identifies the stage worker.
    fn execute(&self, name: &str, task: Task) -> Result<()>;
}

/// Runs every worker on its own named OS thread
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadPerStage;

impl ThreadProvider for ThreadPerStage {
    fn execute(&self, name: &str, task: Task) -> Result<()> {
        thread::Builder::new()
            .name(name.to_string())
            .spawn(task)
            .map(|_| ())
            .map_err(|e| PlumbingError::ThreadError(format!("spawning {name}: {e}")))
    }
}

type WorkerBody = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// A worker wired before the topology started
struct PendingWorker {
    name: String,
    closer: Option<Arc<dyn Close>>,
    body: WorkerBody,
}

/// Registration of one isolating stage
struct StageEntry {
    name: String,
    closer: Arc<dyn Close>,
    metrics: StageMetrics,
}

#[derive(Default)]
struct State {
    started: bool,
    pending: Vec<PendingWorker>,
    completions: Vec<(String, Receiver<()>)>,
    stages: Vec<StageEntry>,
}

struct Inner {
    config: TopologyConfig,
    provider: Arc<dyn ThreadProvider>,
    shutdown: ShutdownSignal,
    next_stage_id: AtomicUsize,
    state: Mutex<State>,
    failures: Arc<Mutex<Vec<PlumbingError>>>,
}

/// Builder for constructing topologies
pub struct TopologyBuilder {
    config: TopologyConfig,
    provider: Arc<dyn ThreadProvider>,
}

impl TopologyBuilder {
    /// Create a builder with default settings and [`ThreadPerStage`]
    pub fn new() -> Self {
        Self {
            config: TopologyConfig::default(),
            provider: Arc::new(ThreadPerStage),
        }
    }

    /// Name used as a prefix for worker thread names
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Queue capacity behind `isolate(stream, ordered)`
    pub fn isolate_capacity(mut self, capacity: usize) -> Self {
        self.config.isolate_capacity = capacity;
        self
    }

    /// Worker count behind `isolate(stream, false)`
    pub fn unordered_workers(mut self, workers: usize) -> Self {
        self.config.unordered_workers = workers;
        self
    }

    /// Execution provider for stage workers
    pub fn provider(mut self, provider: Arc<dyn ThreadProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: TopologyConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the topology
    pub fn build(self) -> Result<Topology> {
        self.config.validate()?;
        Ok(Topology::with_parts(self.config, self.provider))
    }
}

impl Default for TopologyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A graph of streams and the stages wired between them.
///
/// `Topology` is a cheap handle; every [`Stream`] keeps one. Isolating stages
/// register their workers here and the workers start with
/// [`Topology::start`].
#[derive(Clone)]
pub struct Topology {
    inner: Arc<Inner>,
}

impl Topology {
    /// A topology with the default configuration
    pub fn new() -> Self {
        Self::with_parts(TopologyConfig::default(), Arc::new(ThreadPerStage))
    }

    /// Start building a topology
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::new()
    }

    fn with_parts(config: TopologyConfig, provider: Arc<dyn ThreadProvider>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                provider,
                shutdown: ShutdownSignal::new(),
                next_stage_id: AtomicUsize::new(0),
                state: Mutex::new(State::default()),
                failures: Arc::new(Mutex::new(Vec::new())),
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &TopologyConfig {
        &self.inner.config
    }

    /// Signal fired when the topology shuts down.
    ///
    /// Blocking stages sleep on it so shutdown interrupts them.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.inner.shutdown.clone()
    }

    /// Whether shutdown has begun
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_fired()
    }

    /// Create a source stream fed through the returned [`Publisher`]
    pub fn source<T: Tuple>(&self) -> (Publisher<T>, Stream<T>) {
        let stream = Stream::new(self.clone());
        (Publisher::new(stream.clone()), stream)
    }

    /// Create a source stream fed from an iterator on its own worker.
    ///
    /// The worker starts with the topology and stops when the iterator is
    /// exhausted or the topology shuts down.
    pub fn source_iter<T, I>(&self, tuples: I) -> Stream<T>
    where
        T: Tuple,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let stream = Stream::new(self.clone());
        let output = stream.clone();
        let shutdown = self.shutdown_signal();
        let tuples = tuples.into_iter();
        let name = self.stage_name("source", None);
        self.spawn_worker(name, None, move || {
            for tuple in tuples {
                if shutdown.is_fired() {
                    break;
                }
                output.emit(tuple)?;
            }
            Ok(())
        });
        stream
    }

    /// Start every worker wired so far.
    ///
    /// Stages wired after this call start their workers immediately.
    pub fn start(&self) -> Result<RunningTopology> {
        let pending = {
            let mut state = self.inner.state.lock();
            if state.started {
                return Err(PlumbingError::AlreadyStarted);
            }
            state.started = true;
            std::mem::take(&mut state.pending)
        };

        info!(
            topology = %self.inner.config.name,
            workers = pending.len(),
            "starting topology"
        );
        for worker in pending {
            self.launch(worker);
        }

        Ok(RunningTopology {
            topology: self.clone(),
        })
    }

    /// Unique worker name for a new stage
    pub(crate) fn stage_name(&self, kind: &str, tag: Option<&str>) -> String {
        let id = self.inner.next_stage_id.fetch_add(1, Ordering::Relaxed);
        match tag {
            Some(tag) => format!("{}-{}-{}-{}", self.inner.config.name, kind, tag, id),
            None => format!("{}-{}-{}", self.inner.config.name, kind, id),
        }
    }

    /// Track an isolating stage so shutdown can close it
    pub(crate) fn register_stage(
        &self,
        name: &str,
        closer: Arc<dyn Close>,
        metrics: StageMetrics,
    ) {
        debug!(stage = %name, "registered stage");
        if self.is_shutdown() {
            closer.close();
        }
        self.inner.state.lock().stages.push(StageEntry {
            name: name.to_string(),
            closer,
            metrics,
        });
    }

    /// Queue a worker for start, or run it now if the topology is running
    pub(crate) fn spawn_worker<F>(&self, name: String, closer: Option<Arc<dyn Close>>, body: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let worker = PendingWorker {
            name,
            closer,
            body: Box::new(body),
        };
        let worker = {
            let mut state = self.inner.state.lock();
            if !state.started {
                state.pending.push(worker);
                return;
            }
            worker
        };
        self.launch(worker);
    }

    fn launch(&self, worker: PendingWorker) {
        let PendingWorker { name, closer, body } = worker;
        let (done_tx, done_rx) = bounded(1);
        let shutdown = self.shutdown_signal();
        let failures = Arc::clone(&self.inner.failures);
        let worker_name = name.clone();
        let worker_closer = closer.clone();

        let task: Task = Box::new(move || {
            debug!(stage = %worker_name, "worker started");
            let result = panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|payload| {
                Err(PlumbingError::ThreadError(format!(
                    "worker {worker_name} panicked: {}",
                    panic_message(payload.as_ref())
                )))
            });
            match result {
                Ok(()) => {}
                Err(e) if e.is_teardown() && shutdown.is_fired() => {}
                Err(e) => {
                    error!(stage = %worker_name, error = %e, "worker failed");
                    failures.lock().push(e);
                    if let Some(closer) = &worker_closer {
                        closer.close();
                    }
                }
            }
            debug!(stage = %worker_name, "worker stopped");
            let _ = done_tx.send(());
        });

        match self.inner.provider.execute(&name, task) {
            Ok(()) => self.inner.state.lock().completions.push((name, done_rx)),
            Err(e) => {
                error!(stage = %name, error = %e, "could not start worker");
                self.inner.failures.lock().push(e);
                if let Some(closer) = &closer {
                    closer.close();
                }
            }
        }
    }

    /// Fire the shutdown signal and close every stage
    fn close_all(&self) {
        self.inner.shutdown.fire();
        let closers: Vec<_> = {
            let mut state = self.inner.state.lock();
            state.pending.clear();
            state.stages.iter().map(|s| Arc::clone(&s.closer)).collect()
        };
        for closer in closers {
            closer.close();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

/// A started topology that can be monitored and torn down
pub struct RunningTopology {
    topology: Topology,
}

impl RunningTopology {
    /// The topology being run
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Whether shutdown has begun
    pub fn is_shutdown(&self) -> bool {
        self.topology.is_shutdown()
    }

    /// Worker failures recorded so far
    pub fn failures(&self) -> Vec<PlumbingError> {
        self.topology.inner.failures.lock().clone()
    }

    /// Names of the isolating stages, in wiring order
    pub fn stage_names(&self) -> Vec<String> {
        let state = self.topology.inner.state.lock();
        state.stages.iter().map(|s| s.name.clone()).collect()
    }

    /// Metrics of the isolating stage whose name starts with `prefix`
    pub fn metrics(&self, prefix: &str) -> Option<StageMetrics> {
        let state = self.topology.inner.state.lock();
        state
            .stages
            .iter()
            .find(|s| s.name.starts_with(prefix))
            .map(|s| s.metrics.clone())
    }

    /// Get a summary of all stage metrics
    pub fn metrics_summary(&self) -> String {
        let state = self.topology.inner.state.lock();
        let mut summary = format!("Topology {} Metrics Summary:\n", self.topology.config().name);
        for stage in &state.stages {
            summary.push_str(&format!(
                "  {}: {}\n",
                stage.name,
                stage.metrics.snapshot().format()
            ));
        }
        summary
    }

    /// Tear the topology down and wait for every worker to stop.
    ///
    /// Queued tuples are dropped. Returns the first worker failure, if any.
    pub fn shutdown(self) -> Result<()> {
        self.stop(None)
    }

    /// Like [`RunningTopology::shutdown`], giving up on workers still running
    /// after `timeout`
    pub fn shutdown_timeout(self, timeout: Duration) -> Result<()> {
        self.stop(Some(timeout))
    }

    fn stop(&self, timeout: Option<Duration>) -> Result<()> {
        info!(topology = %self.topology.config().name, "shutting down topology");
        self.topology.close_all();

        let deadline = timeout.map(|t| Instant::now() + t);
        let completions = std::mem::take(&mut self.topology.inner.state.lock().completions);
        let mut stuck = Vec::new();
        for (name, done) in completions {
            let finished = match deadline {
                None => done.recv().is_ok(),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match done.recv_timeout(remaining) {
                        Ok(()) => true,
                        Err(RecvTimeoutError::Timeout) => {
                            stuck.push(name);
                            continue;
                        }
                        Err(RecvTimeoutError::Disconnected) => false,
                    }
                }
            };
            if !finished {
                let e = PlumbingError::ThreadError(format!("worker {name} exited abnormally"));
                error!(stage = %name, "worker exited without reporting");
                self.topology.inner.failures.lock().push(e);
            }
        }

        if let Some(e) = self.topology.inner.failures.lock().first() {
            return Err(e.clone());
        }
        if !stuck.is_empty() {
            return Err(PlumbingError::ShutdownError(format!(
                "workers still running: {}",
                stuck.join(", ")
            )));
        }
        Ok(())
    }
}

impl Drop for RunningTopology {
    fn drop(&mut self) {
        self.topology.close_all();
    }
}
