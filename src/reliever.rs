//! Pressure relief: isolation that never blocks the producer.
//!
//! Each partition key gets its own buffer of at most `count` tuples. When the
//! downstream worker falls behind, a new tuple for a full key evicts that
//! key's oldest tuple, so downstream always sees the freshest state per key.
//! Evictions are expected behavior; they are counted in the stage metrics and
//! never reported as failures.

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::buffer::Close;
use crate::error::{PlumbingError, Result};
use crate::metrics::StageMetrics;
use crate::stage::{Drain, StageRunner};
use crate::stream::{Stream, Tuple};

struct KeyedState<K, T> {
    buffers: HashMap<K, VecDeque<T>>,
    /// Keys with pending tuples, in the order they will be served
    ready: VecDeque<K>,
    closed: bool,
}

struct KeyedInner<K, T> {
    state: Mutex<KeyedState<K, T>>,
    available: Condvar,
    count: usize,
    metrics: StageMetrics,
}

/// Per-key bounded buffers with drop-oldest eviction.
///
/// Keys with pending tuples are served round-robin: [`KeyedBuffer::pop`] takes
/// the oldest tuple of the key at the front of the ready ring and moves that
/// key to the back if it still has tuples, so no key waits more than one pass
/// over the others.
pub struct KeyedBuffer<K, T> {
    inner: Arc<KeyedInner<K, T>>,
}

impl<K, T> Clone for KeyedBuffer<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, T> KeyedBuffer<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Send + 'static,
{
    /// Keep at most `count` tuples per key. A count of 0 is treated as 1.
    pub fn new(count: usize) -> Self {
        let count = if count == 0 {
            warn!("pressure reliever count 0 is invalid, using 1");
            1
        } else {
            count
        };
        Self {
            inner: Arc::new(KeyedInner {
                state: Mutex::new(KeyedState {
                    buffers: HashMap::new(),
                    ready: VecDeque::new(),
                    closed: false,
                }),
                available: Condvar::new(),
                count,
                metrics: StageMetrics::new(),
            }),
        }
    }

    /// Append a tuple to its key's buffer, evicting that key's oldest tuple
    /// when the buffer is full. Never waits for the consumer.
    pub fn push(&self, key: K, tuple: T) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(PlumbingError::Closed);
        }

        let buffer = state.buffers.entry(key.clone()).or_default();
        let was_empty = buffer.is_empty();
        buffer.push_back(tuple);
        if buffer.len() > self.inner.count {
            buffer.pop_front();
            self.inner.metrics.record_dropped();
            trace!(count = self.inner.count, "evicted oldest tuple for key");
        }

        if was_empty {
            state.ready.push_back(key);
            drop(state);
            self.inner.available.notify_one();
        }
        Ok(())
    }

    /// Take the next tuple, waiting while every buffer is empty
    pub fn pop(&self) -> Result<T> {
        let mut state = self.inner.state.lock();
        loop {
            if state.closed {
                return Err(PlumbingError::Closed);
            }
            if let Some(tuple) = Self::take_ready(&mut state) {
                return Ok(tuple);
            }
            self.inner.available.wait(&mut state);
        }
    }

    fn take_ready(state: &mut KeyedState<K, T>) -> Option<T> {
        while let Some(key) = state.ready.pop_front() {
            let Some(buffer) = state.buffers.get_mut(&key) else {
                continue;
            };
            let Some(tuple) = buffer.pop_front() else {
                continue;
            };
            if !buffer.is_empty() {
                state.ready.push_back(key);
            }
            return Some(tuple);
        }
        None
    }

    /// Tuples currently pending across every key
    pub fn len(&self) -> usize {
        let state = self.inner.state.lock();
        state.buffers.values().map(VecDeque::len).sum()
    }

    /// Whether no tuple is pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-key capacity
    pub fn count(&self) -> usize {
        self.inner.count
    }

    /// Counters for this buffer; `dropped` counts evictions
    pub fn metrics(&self) -> StageMetrics {
        self.inner.metrics.clone()
    }
}

impl<K, T> KeyedBuffer<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + 'static,
{
    /// Copy of the tuples pending for `key`, oldest first
    pub fn pending(&self, key: &K) -> Vec<T> {
        let state = self.inner.state.lock();
        state
            .buffers
            .get(key)
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl<K, T> Drain<T> for KeyedBuffer<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Send + 'static,
{
    fn take(&self) -> Result<T> {
        self.pop()
    }
}

impl<K, T> Close for KeyedBuffer<K, T>
where
    K: Send,
    T: Send,
{
    fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        state.buffers.clear();
        state.ready.clear();
        drop(state);
        self.inner.available.notify_all();
    }
}

/// Relieve pressure on upstream processing by discarding tuples.
///
/// The returned stream is isolated from `stream`: the producer never waits
/// for downstream processing. Up to `count` of the most recent tuples per key
/// (as computed by `key_fn`) are held while downstream is slow; older tuples
/// not yet forwarded are discarded. Order is kept within a key but not across
/// keys.
pub fn pressure_reliever<T, K, F>(stream: &Stream<T>, key_fn: F, count: usize) -> Stream<T>
where
    T: Tuple,
    K: Eq + Hash + Clone + Send + 'static,
    F: Fn(&T) -> K + Send + Sync + 'static,
{
    let topology = stream.topology();
    let name = topology.stage_name("pressure-reliever", stream.tag_name());
    let buffer = KeyedBuffer::new(count);
    let closer = Arc::new(buffer.clone());
    topology.register_stage(&name, closer.clone(), buffer.metrics());
    debug!(stage = %name, count = buffer.count(), "wiring pressure reliever");

    let input = buffer.clone();
    stream.subscribe(move |tuple| input.push(key_fn(&tuple), tuple));

    let output = Stream::new(topology.clone());
    let runner = StageRunner::new(name.clone(), buffer.clone(), output.clone(), buffer.metrics());
    topology.spawn_worker(name, Some(closer), move || runner.run());
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Topology;
    use crossbeam::channel::unbounded;
    use std::thread;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_keeps_last_count_per_key() {
        let buffer = KeyedBuffer::new(3);
        for i in 0..10 {
            buffer.push("a", i).unwrap();
        }
        assert_eq!(buffer.pending(&"a"), vec![7, 8, 9]);
        assert_eq!(buffer.metrics().total_dropped(), 7);
    }

    #[test]
    fn test_eviction_stays_within_key() {
        let buffer = KeyedBuffer::new(2);
        for i in 0..6 {
            let key = if i % 2 == 0 { 'a' } else { 'b' };
            buffer.push(key, i).unwrap();
        }
        buffer.push('a', 100).unwrap();
        assert_eq!(buffer.pending(&'a'), vec![4, 100]);
        assert_eq!(buffer.pending(&'b'), vec![3, 5]);
    }

    #[test]
    fn test_pop_round_robins_keys() {
        let buffer = KeyedBuffer::new(10);
        for i in 0..3 {
            buffer.push("a", format!("a{i}")).unwrap();
        }
        buffer.push("b", "b0".to_string()).unwrap();

        let order: Vec<_> = (0..4).map(|_| buffer.pop().unwrap()).collect();
        assert_eq!(order, vec!["a0", "b0", "a1", "a2"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_zero_count_treated_as_one() {
        let buffer = KeyedBuffer::new(0);
        buffer.push(1, 'x').unwrap();
        buffer.push(1, 'y').unwrap();
        assert_eq!(buffer.pending(&1), vec!['y']);
    }

    #[test]
    fn test_close_wakes_consumer() {
        let buffer: KeyedBuffer<u8, u8> = KeyedBuffer::new(1);
        let consumer = buffer.clone();
        let handle = thread::spawn(move || consumer.pop());
        thread::sleep(Duration::from_millis(50));
        buffer.close();
        assert_eq!(handle.join().unwrap(), Err(PlumbingError::Closed));
        assert_eq!(buffer.push(1, 1), Err(PlumbingError::Closed));
    }

    #[test]
    fn test_slow_consumer_never_blocks_producer() {
        let topology = Topology::new();
        let (publisher, source) = topology.source::<(char, u32)>();
        let (gate_tx, gate_rx) = unbounded::<()>();
        let (tx, rx) = unbounded();
        pressure_reliever(&source, |(key, _)| *key, 2).sink(move |t| {
            let _ = gate_rx.recv();
            tx.send(t).unwrap();
        });

        let running = topology.start().unwrap();
        publisher.submit(('a', 0)).unwrap();
        // Let the worker pick up the first tuple and park in the sink.
        thread::sleep(Duration::from_millis(50));
        for i in 1..=20 {
            publisher.submit(('a', i)).unwrap();
            publisher.submit(('b', i)).unwrap();
        }

        for _ in 0..5 {
            gate_tx.send(()).unwrap();
        }
        let got: Vec<_> = (0..5).map(|_| rx.recv_timeout(TIMEOUT).unwrap()).collect();
        assert_eq!(got[0], ('a', 0));

        let a: Vec<_> = got.iter().filter(|(k, _)| *k == 'a').map(|(_, v)| *v).collect();
        let b: Vec<_> = got.iter().filter(|(k, _)| *k == 'b').map(|(_, v)| *v).collect();
        assert_eq!(a, vec![0, 19, 20]);
        assert_eq!(b, vec![19, 20]);

        let dropped = running.metrics("topology-pressure-reliever").unwrap().total_dropped();
        assert_eq!(dropped, 36);
        running.shutdown().unwrap();
    }
}
