//! Topology configuration.
//!
//! Capacities and worker counts used when a plumbing function is called
//! without an explicit size.

use crate::error::{PlumbingError, Result};

/// Queue capacity used by `isolate(stream, ordered)`.
///
/// The queue is bounded: once it holds this many tuples the producer blocks.
/// Raising it lets the isolated side lag further behind, at the cost of memory.
/// A capacity large enough to absorb a sustained rate mismatch can exhaust
/// memory, and allocation failure aborts the process.
pub const DEFAULT_ISOLATE_CAPACITY: usize = 1 << 16;

/// Consumer workers draining an unordered isolate.
pub const DEFAULT_UNORDERED_WORKERS: usize = 4;

/// Per-input slot capacity of a barrier built without an explicit capacity.
pub const DEFAULT_BARRIER_CAPACITY: usize = 1;

/// Queue in front of each pipeline of the concurrent composer.
pub const CONCURRENT_ISOLATE_CAPACITY: usize = 1;

/// Barrier slot capacity in the concurrent composer.
///
/// Lets faster pipelines run a few tuples ahead of slower ones.
pub const CONCURRENT_BARRIER_CAPACITY: usize = 10;

/// Settings shared by every stage wired into one topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyConfig {
    /// Topology name, used as a prefix for worker thread names.
    pub name: String,

    /// Capacity of the queue behind `isolate(stream, ordered)`.
    pub isolate_capacity: usize,

    /// Worker count behind `isolate(stream, false)`.
    pub unordered_workers: usize,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            name: "topology".to_string(),
            isolate_capacity: DEFAULT_ISOLATE_CAPACITY,
            unordered_workers: DEFAULT_UNORDERED_WORKERS,
        }
    }
}

impl TopologyConfig {
    /// Reject settings no topology can run with.
    pub fn validate(&self) -> Result<()> {
        if self.isolate_capacity == 0 {
            return Err(PlumbingError::ConfigError(
                "isolate_capacity must be at least 1".into(),
            ));
        }
        if self.unordered_workers == 0 {
            return Err(PlumbingError::ConfigError(
                "unordered_workers must be at least 1".into(),
            ));
        }
        if self.name.is_empty() {
            return Err(PlumbingError::ConfigError("name must not be empty".into()));
        }
        Ok(())
    }
}
