//! Stream plumbing: thread-decoupling primitives for push-based stream graphs.
//!
//! A [`Topology`] owns a graph of [`Stream`]s. Inline operators (`map`,
//! `filter`, `pipe`, the pacing stages) run on whichever thread delivers the
//! tuple; the plumbing stages below hand tuples across threads.
//!
//! # Features
//!
//! - Isolation through a bounded queue, ordered (one worker) or unordered
//!   (several workers)
//! - Pressure relief: per-key bounded history that drops the oldest tuple
//!   instead of blocking the producer
//! - N-way barrier joining independent streams in lockstep
//! - Concurrent analytics: fan out, run pipelines in parallel, join, combine
//! - Per-tuple delay, throttle and one-shot delay
//! - Per-stage metrics: forwarded, dropped and blocked counts, latency
//!   percentiles
//! - Pluggable [`ThreadProvider`] for worker threads
//!
//! # Example
//!
//! ```ignore
//! use stream_plumbing::{concurrent_map, isolate, Mapper, Topology};
//!
//! let topology = Topology::builder().name("readings").build()?;
//! let (publisher, readings) = topology.source::<f64>();
//!
//! let mappers: Vec<Mapper<f64, f64>> = vec![
//!     Box::new(|x| Some(x * 2.0)),
//!     Box::new(|x| Some(x.sqrt())),
//! ];
//! concurrent_map(&isolate(&readings, true), mappers, |r| r[0] + r[1])?
//!     .sink(|combined| println!("{combined}"));
//!
//! let running = topology.start()?;
//! publisher.submit(16.0)?;
//! running.shutdown()?;
//! ```

pub mod barrier;
pub mod buffer;
pub mod concurrent;
pub mod config;
pub mod error;
pub mod isolate;
pub mod metrics;
pub mod pacing;
pub mod reliever;
pub mod signal;
pub mod stage;
pub mod stream;
pub mod topology;

// Re-exports for convenience
pub use barrier::{barrier, barrier_array, barrier_default, BarrierSlots};
pub use buffer::{BoundedQueue, Close};
pub use concurrent::{concurrent, concurrent_map, Mapper, Pipeline};
pub use config::TopologyConfig;
pub use error::{PlumbingError, Result};
pub use isolate::{isolate, isolate_bounded};
pub use metrics::{MetricsSnapshot, StageMetrics};
pub use pacing::{blocking_delay, blocking_one_shot_delay, blocking_throttle};
pub use reliever::{pressure_reliever, KeyedBuffer};
pub use signal::ShutdownSignal;
pub use stage::{FilterStage, MapStage, Stage};
pub use stream::{Publisher, Stream, Tuple};
pub use topology::{
    RunningTopology, Task, ThreadPerStage, ThreadProvider, Topology, TopologyBuilder,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
