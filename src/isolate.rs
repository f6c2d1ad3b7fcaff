//! Isolation: decouple a stream's producer from its downstream processing.
//!
//! ```text
//! producer thread ──push──▶ [ bounded queue ] ──pop──▶ worker(s) ──▶ downstream
//! ```
//!
//! The producer only blocks when the queue is full. Downstream stages run on
//! the isolate's worker threads, which come from the topology's
//! [`ThreadProvider`](crate::topology::ThreadProvider).

use std::sync::Arc;
use tracing::debug;

use crate::buffer::BoundedQueue;
use crate::stage::StageRunner;
use crate::stream::{Stream, Tuple};

/// Isolate upstream processing from downstream processing.
///
/// With `ordered` set, one worker forwards tuples in arrival order. Otherwise
/// [`TopologyConfig::unordered_workers`](crate::config::TopologyConfig)
/// workers drain the queue concurrently and downstream sees the tuples in no
/// particular order, none lost or duplicated.
///
/// The queue holds
/// [`TopologyConfig::isolate_capacity`](crate::config::TopologyConfig)
/// tuples (default [`DEFAULT_ISOLATE_CAPACITY`](crate::config::DEFAULT_ISOLATE_CAPACITY))
/// before the producer blocks. A capacity sized to absorb a persistent rate
/// mismatch instead of blocking can exhaust memory; allocation failure aborts
/// the process.
pub fn isolate<T: Tuple>(stream: &Stream<T>, ordered: bool) -> Stream<T> {
    let config = stream.topology().config();
    let capacity = config.isolate_capacity;
    if ordered {
        wire(stream, "isolate", capacity, 1)
    } else {
        wire(stream, "unordered-isolate", capacity, config.unordered_workers)
    }
}

/// Isolate upstream processing from downstream processing through a queue of
/// `queue_capacity` tuples.
///
/// When the queue is full the producer blocks until the worker frees space.
/// Tuples are forwarded in the order they were received. A capacity of 0 is
/// treated as 1.
pub fn isolate_bounded<T: Tuple>(stream: &Stream<T>, queue_capacity: usize) -> Stream<T> {
    wire(stream, "isolate", queue_capacity, 1)
}

fn wire<T: Tuple>(stream: &Stream<T>, kind: &str, capacity: usize, workers: usize) -> Stream<T> {
    let topology = stream.topology();
    let name = topology.stage_name(kind, stream.tag_name());
    let queue = BoundedQueue::new(capacity);
    let closer = Arc::new(queue.clone());
    topology.register_stage(&name, closer.clone(), queue.metrics());
    debug!(stage = %name, capacity = queue.capacity(), workers, "wiring isolate");

    let input = queue.clone();
    stream.subscribe(move |tuple| input.push(tuple));

    let output = Stream::new(topology.clone());
    for worker in 0..workers {
        let worker_name = if workers == 1 {
            name.clone()
        } else {
            format!("{name}-{worker}")
        };
        let runner = StageRunner::new(
            worker_name.clone(),
            queue.clone(),
            output.clone(),
            queue.metrics(),
        );
        topology.spawn_worker(worker_name, Some(closer.clone()), move || runner.run());
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlumbingError;
    use crate::topology::Topology;
    use crossbeam::channel::unbounded;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_ordered_preserves_arrival_order() {
        let topology = Topology::new();
        let (publisher, source) = topology.source::<u32>();
        let (tx, rx) = unbounded();
        isolate(&source, true).sink(move |x| tx.send(x).unwrap());

        let running = topology.start().unwrap();
        for i in 0..500 {
            publisher.submit(i).unwrap();
        }
        let got: Vec<_> = (0..500).map(|_| rx.recv_timeout(TIMEOUT).unwrap()).collect();
        assert_eq!(got, (0..500).collect::<Vec<_>>());
        running.shutdown().unwrap();
    }

    #[test]
    fn test_unordered_is_permutation() {
        let topology = Topology::builder().unordered_workers(3).build().unwrap();
        let (publisher, source) = topology.source::<u32>();
        let (tx, rx) = unbounded();
        isolate(&source, false).sink(move |x| tx.send(x).unwrap());

        let running = topology.start().unwrap();
        for i in 0..300 {
            publisher.submit(i).unwrap();
        }
        let got: HashSet<_> = (0..300).map(|_| rx.recv_timeout(TIMEOUT).unwrap()).collect();
        assert_eq!(got, (0..300).collect::<HashSet<_>>());
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(running.stage_names().len(), 1);
        running.shutdown().unwrap();
    }

    #[test]
    fn test_producer_runs_on_other_thread() {
        let topology = Topology::new();
        let (publisher, source) = topology.source::<u8>();
        let (tx, rx) = unbounded();
        isolate_bounded(&source, 4).sink(move |_| {
            tx.send(thread::current().id()).unwrap();
        });

        let running = topology.start().unwrap();
        publisher.submit(1).unwrap();
        let worker = rx.recv_timeout(TIMEOUT).unwrap();
        assert_ne!(worker, thread::current().id());
        running.shutdown().unwrap();
    }

    #[test]
    fn test_full_queue_blocks_producer() {
        let topology = Topology::new();
        let (publisher, source) = topology.source::<u32>();
        let (gate_tx, gate_rx) = unbounded::<()>();
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        isolate_bounded(&source, 2).sink(move |_| {
            let _ = gate_rx.recv();
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let running = topology.start().unwrap();
        let producer = publisher.clone();
        let handle = thread::spawn(move || {
            for i in 0..4 {
                producer.submit(i).unwrap();
            }
        });

        // One tuple held by the worker, two queued, the fourth blocks.
        thread::sleep(Duration::from_millis(100));
        assert!(!handle.is_finished());
        assert!(running.metrics("topology-isolate").unwrap().total_blocked() >= 1);

        for _ in 0..4 {
            gate_tx.send(()).unwrap();
        }
        handle.join().unwrap();
        running.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_fails_blocked_producer() {
        let topology = Topology::new();
        let (publisher, source) = topology.source::<u32>();
        let (_gate_tx, gate_rx) = unbounded::<()>();
        isolate_bounded(&source, 1).sink(move |_| {
            let _ = gate_rx.recv_timeout(Duration::from_millis(200));
        });

        let running = topology.start().unwrap();
        let producer = publisher.clone();
        let handle = thread::spawn(move || {
            let mut last = Ok(());
            for i in 0..10 {
                last = producer.submit(i);
                if last.is_err() {
                    break;
                }
            }
            last
        });

        thread::sleep(Duration::from_millis(50));
        running.shutdown().unwrap();
        assert_eq!(handle.join().unwrap(), Err(PlumbingError::Closed));
    }

    #[test]
    fn test_downstream_failure_stops_worker() {
        let topology = Topology::new();
        let (publisher, source) = topology.source::<u32>();
        isolate_bounded(&source, 1)
            .try_map(|x| {
                if x == 2 {
                    Err(PlumbingError::StageError("rejected".into()))
                } else {
                    Ok(x)
                }
            })
            .sink(|_| {});

        let running = topology.start().unwrap();
        let mut result = Ok(());
        for i in 0..100 {
            result = publisher.submit(i);
            if result.is_err() {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(result, Err(PlumbingError::Closed));
        assert_eq!(
            running.failures(),
            vec![PlumbingError::StageError("rejected".into())]
        );
        assert_eq!(
            running.shutdown(),
            Err(PlumbingError::StageError("rejected".into()))
        );
    }

    #[test]
    fn test_panicking_worker_releases_producer() {
        let topology = Topology::new();
        let (publisher, source) = topology.source::<u32>();
        isolate_bounded(&source, 1).sink(|x| panic!("cannot handle {x}"));

        let running = topology.start().unwrap();
        let (done_tx, done_rx) = unbounded();
        thread::spawn(move || {
            let result = (0..10).try_for_each(|i| publisher.submit(i));
            let _ = done_tx.send(result);
        });

        assert_eq!(done_rx.recv_timeout(TIMEOUT).unwrap(), Err(PlumbingError::Closed));
        let failures = running.failures();
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            &failures[0],
            PlumbingError::ThreadError(msg) if msg.contains("panicked: cannot handle 0")
        ));
        assert!(matches!(
            running.shutdown(),
            Err(PlumbingError::ThreadError(_))
        ));
    }
}
