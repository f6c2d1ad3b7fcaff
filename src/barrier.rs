//! N-way synchronization barrier.
//!
//! ```text
//! stream 0 ──▶ [ slot 0 ] ─┐
//! stream 1 ──▶ [ slot 1 ] ─┼──▶ round worker ──▶ [t0, t1, …, tn-1]
//!    …            …        │
//! stream n ──▶ [ slot n ] ─┘
//! ```
//!
//! Each round takes one tuple from every slot under a single lock, so a round
//! either sees all N slots non-empty or takes nothing. A stream that stops
//! producing stalls every round: the other slots fill and their producers
//! block. There is no timeout and no partial round.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::buffer::Close;
use crate::config::DEFAULT_BARRIER_CAPACITY;
use crate::error::{PlumbingError, Result};
use crate::metrics::StageMetrics;
use crate::stage::{Drain, StageRunner};
use crate::stream::{Stream, Tuple};

struct SlotState<T> {
    slots: Vec<VecDeque<T>>,
    closed: bool,
}

impl<T> SlotState<T> {
    fn round_ready(&self) -> bool {
        !self.slots.is_empty() && self.slots.iter().all(|slot| !slot.is_empty())
    }
}

struct SlotsInner<T> {
    state: Mutex<SlotState<T>>,
    /// Signalled when a round may have become complete
    round: Condvar,
    /// Signalled when a round frees space in every slot
    space: Condvar,
    capacity: usize,
    metrics: StageMetrics,
}

/// The per-input slots of a barrier
pub struct BarrierSlots<T> {
    inner: Arc<SlotsInner<T>>,
}

impl<T> Clone for BarrierSlots<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> BarrierSlots<T> {
    /// `inputs` slots of `capacity` tuples each. A capacity of 0 is treated
    /// as 1.
    pub fn new(inputs: usize, capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            warn!("barrier queue capacity 0 is invalid, using 1");
            1
        } else {
            capacity
        };
        Self {
            inner: Arc::new(SlotsInner {
                state: Mutex::new(SlotState {
                    slots: (0..inputs).map(|_| VecDeque::with_capacity(capacity)).collect(),
                    closed: false,
                }),
                round: Condvar::new(),
                space: Condvar::new(),
                capacity,
                metrics: StageMetrics::new(),
            }),
        }
    }

    /// Queue a tuple from input `index`, waiting while that slot is full
    pub fn push(&self, index: usize, tuple: T) -> Result<()> {
        let mut state = self.inner.state.lock();
        let mut waited = false;
        loop {
            if state.closed {
                return Err(PlumbingError::Closed);
            }
            if state.slots[index].len() < self.inner.capacity {
                break;
            }
            if !waited {
                self.inner.metrics.record_blocked();
                waited = true;
            }
            self.inner.space.wait(&mut state);
        }

        state.slots[index].push_back(tuple);
        if state.round_ready() {
            drop(state);
            self.inner.round.notify_one();
        }
        Ok(())
    }

    /// Wait until every slot holds a tuple, then take one from each, ordered
    /// by input index
    pub fn take_round(&self) -> Result<Vec<T>> {
        let mut state = self.inner.state.lock();
        loop {
            if state.closed {
                return Err(PlumbingError::Closed);
            }
            if state.round_ready() {
                break;
            }
            self.inner.round.wait(&mut state);
        }

        let round: Vec<T> = state.slots.iter_mut().filter_map(VecDeque::pop_front).collect();
        drop(state);
        self.inner.space.notify_all();
        Ok(round)
    }

    /// Number of inputs
    pub fn inputs(&self) -> usize {
        self.inner.state.lock().slots.len()
    }

    /// Tuples queued in each slot
    pub fn depths(&self) -> Vec<usize> {
        let state = self.inner.state.lock();
        state.slots.iter().map(VecDeque::len).collect()
    }

    /// Counters for this barrier; `blocked` counts pushes into a full slot
    pub fn metrics(&self) -> StageMetrics {
        self.inner.metrics.clone()
    }
}

impl<T: Send + 'static> Drain<Vec<T>> for BarrierSlots<T> {
    fn take(&self) -> Result<Vec<T>> {
        self.take_round()
    }
}

impl<T: Send> Close for BarrierSlots<T> {
    fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        for slot in &mut state.slots {
            slot.clear();
        }
        drop(state);
        self.inner.round.notify_all();
        self.inner.space.notify_all();
    }
}

/// A tuple synchronization barrier with one-tuple slots.
///
/// Same as `barrier(streams, 1)`.
pub fn barrier_default<T: Tuple>(streams: &[Stream<T>]) -> Result<Stream<Vec<T>>> {
    barrier(streams, DEFAULT_BARRIER_CAPACITY)
}

/// A tuple synchronization barrier.
///
/// Once the barrier holds a tuple from each of `streams` it emits a list with
/// stream 0's tuple at position 0, stream 1's at position 1, and so on, then
/// waits for the next tuple from every stream. Each input has a slot of
/// `queue_capacity` tuples; an input blocks while its slot is full.
///
/// The output is isolated from the inputs: rounds are assembled and emitted on
/// the barrier's own worker.
pub fn barrier<T: Tuple>(streams: &[Stream<T>], queue_capacity: usize) -> Result<Stream<Vec<T>>> {
    let first = streams.first().ok_or(PlumbingError::NoStreams)?;
    let topology = first.topology();
    let name = topology.stage_name("barrier", first.tag_name());
    let slots = BarrierSlots::new(streams.len(), queue_capacity);
    let closer = Arc::new(slots.clone());
    topology.register_stage(&name, closer.clone(), slots.metrics());
    debug!(stage = %name, inputs = streams.len(), capacity = queue_capacity, "wiring barrier");

    for (index, stream) in streams.iter().enumerate() {
        let slots = slots.clone();
        stream.subscribe(move |tuple| slots.push(index, tuple));
    }

    let output = Stream::new(topology.clone());
    let runner = StageRunner::new(name.clone(), slots.clone(), output.clone(), slots.metrics());
    topology.spawn_worker(name, Some(closer), move || runner.run());
    Ok(output)
}

/// A barrier over a number of streams known at compile time, emitting arrays
pub fn barrier_array<T: Tuple, const N: usize>(
    streams: &[Stream<T>; N],
    queue_capacity: usize,
) -> Result<Stream<[T; N]>> {
    let rounds = barrier(streams.as_slice(), queue_capacity)?;
    Ok(rounds.try_map(|round: Vec<T>| {
        let len = round.len();
        <[T; N]>::try_from(round).map_err(|_| {
            PlumbingError::StageError(format!("barrier round had {len} tuples, expected {N}"))
        })
    }))
}
