//! Per-tuple pacing.
//!
//! These stages run inline on the thread that delivers the tuple and block
//! that thread. They introduce no worker of their own. Sleeps wake early when
//! the topology shuts down, failing the tuple with
//! [`PlumbingError::Interrupted`](crate::error::PlumbingError::Interrupted).
//!
//! Durations are truncated to whole milliseconds.

use std::time::{Duration, Instant};

use crate::error::Result;
use crate::signal::ShutdownSignal;
use crate::stage::Stage;
use crate::stream::{Stream, Tuple};

fn whole_millis(delay: Duration) -> Duration {
    Duration::from_millis(delay.as_millis() as u64)
}

/// Sleeps before forwarding every tuple
#[derive(Debug)]
pub struct BlockingDelay {
    delay: Duration,
    shutdown: ShutdownSignal,
}

impl BlockingDelay {
    /// Sleep `delay` before each tuple, waking early on `shutdown`
    pub fn new(delay: Duration, shutdown: ShutdownSignal) -> Self {
        Self {
            delay: whole_millis(delay),
            shutdown,
        }
    }
}

impl<T: Send + 'static> Stage<T, T> for BlockingDelay {
    fn process(&mut self, input: T) -> Result<Option<T>> {
        self.shutdown.sleep(self.delay)?;
        Ok(Some(input))
    }

    fn name(&self) -> &str {
        "blocking-delay"
    }
}

/// Holds forwarded tuples to a constant cadence.
///
/// Keeps the deadline of the next forward. A tuple arriving before it waits
/// until the deadline; the next deadline is then `delay` after the later of
/// now and the old deadline. Waiting out an early arrival therefore makes up
/// for time lost downstream, and a slow stretch never builds up a burst.
#[derive(Debug)]
pub struct BlockingThrottle {
    delay: Duration,
    next: Option<Instant>,
    shutdown: ShutdownSignal,
}

impl BlockingThrottle {
    /// Forward at most one tuple per `delay`, waking early on `shutdown`
    pub fn new(delay: Duration, shutdown: ShutdownSignal) -> Self {
        Self {
            delay: whole_millis(delay),
            next: None,
            shutdown,
        }
    }
}

impl<T: Send + 'static> Stage<T, T> for BlockingThrottle {
    fn process(&mut self, input: T) -> Result<Option<T>> {
        if let Some(deadline) = self.next {
            let now = Instant::now();
            if now < deadline {
                self.shutdown.sleep(deadline - now)?;
            }
        }

        let now = Instant::now();
        let base = match self.next {
            Some(deadline) if deadline > now => deadline,
            _ => now,
        };
        self.next = Some(base + self.delay);
        Ok(Some(input))
    }

    fn name(&self) -> &str {
        "blocking-throttle"
    }
}

/// Sleeps before the first tuple only
#[derive(Debug)]
pub struct OneShotDelay {
    delay: Option<Duration>,
    shutdown: ShutdownSignal,
}

impl OneShotDelay {
    /// Sleep `delay` before the first tuple, waking early on `shutdown`
    pub fn new(delay: Duration, shutdown: ShutdownSignal) -> Self {
        Self {
            delay: Some(whole_millis(delay)),
            shutdown,
        }
    }
}

impl<T: Send + 'static> Stage<T, T> for OneShotDelay {
    fn process(&mut self, input: T) -> Result<Option<T>> {
        if let Some(delay) = self.delay.take() {
            self.shutdown.sleep(delay)?;
        }
        Ok(Some(input))
    }

    fn name(&self) -> &str {
        "one-shot-delay"
    }
}

/// Delay every tuple by `delay` on the processing thread.
///
/// The delay adds to whatever time the thread already spends downstream; it
/// does not absorb it. See [`blocking_throttle`] for a constant cadence.
pub fn blocking_delay<T: Tuple>(stream: &Stream<T>, delay: Duration) -> Stream<T> {
    let shutdown = stream.topology().shutdown_signal();
    stream.pipe(BlockingDelay::new(delay, shutdown))
}

/// Forward at most one tuple per `delay`, blocking the processing thread.
///
/// The first tuple is never delayed.
pub fn blocking_throttle<T: Tuple>(stream: &Stream<T>, delay: Duration) -> Stream<T> {
    let shutdown = stream.topology().shutdown_signal();
    stream.pipe(BlockingThrottle::new(delay, shutdown))
}

/// Delay only the first tuple by `delay`
pub fn blocking_one_shot_delay<T: Tuple>(stream: &Stream<T>, delay: Duration) -> Stream<T> {
    let shutdown = stream.topology().shutdown_signal();
    stream.pipe(OneShotDelay::new(delay, shutdown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlumbingError;
    use crate::topology::Topology;
    use crossbeam::channel::unbounded;
    use std::thread;

    const SLACK: Duration = Duration::from_millis(40);

    fn forward_times<F>(wire: F, tuples: usize) -> (Instant, Vec<Instant>)
    where
        F: FnOnce(&Stream<usize>) -> Stream<usize>,
    {
        let topology = Topology::new();
        let (publisher, source) = topology.source::<usize>();
        let (tx, rx) = unbounded();
        wire(&source).sink(move |_| tx.send(Instant::now()).unwrap());

        let start = Instant::now();
        for i in 0..tuples {
            publisher.submit(i).unwrap();
        }
        (start, rx.try_iter().collect())
    }

    #[test]
    fn test_sub_millisecond_delay_truncates_to_zero() {
        assert_eq!(whole_millis(Duration::from_micros(999)), Duration::ZERO);
        assert_eq!(
            whole_millis(Duration::from_micros(2_500)),
            Duration::from_millis(2)
        );
    }

    #[test]
    fn test_delay_applies_to_every_tuple() {
        let delay = Duration::from_millis(30);
        let (start, times) = forward_times(|s| blocking_delay(s, delay), 3);
        assert_eq!(times.len(), 3);
        assert!(times[0] - start >= delay);
        assert!(times[1] - times[0] >= delay);
        assert!(times[2] - times[1] >= delay);
    }

    #[test]
    fn test_throttle_holds_cadence() {
        let delay = Duration::from_millis(100);
        let (start, times) = forward_times(|s| blocking_throttle(s, delay), 3);
        assert_eq!(times.len(), 3);
        assert!(times[0] - start < SLACK);
        for pair in times.windows(2) {
            let interval = pair[1] - pair[0];
            assert!(interval >= delay - Duration::from_millis(2), "{interval:?}");
            assert!(interval < delay + SLACK, "{interval:?}");
        }
    }

    #[test]
    fn test_throttle_absorbs_slow_downstream() {
        let delay = Duration::from_millis(50);
        let topology = Topology::new();
        let (publisher, source) = topology.source::<usize>();
        let (tx, rx) = unbounded();
        blocking_throttle(&source, delay).sink(move |i| {
            tx.send(Instant::now()).unwrap();
            if i == 0 {
                thread::sleep(Duration::from_millis(30));
            }
        });

        for i in 0..3 {
            publisher.submit(i).unwrap();
        }
        let times: Vec<_> = rx.try_iter().collect();
        // The 30ms spent downstream counts against the next interval.
        let interval = times[1] - times[0];
        assert!(interval < delay + SLACK, "{interval:?}");
        assert!(interval >= delay - Duration::from_millis(2), "{interval:?}");
    }

    #[test]
    fn test_one_shot_delays_first_only() {
        let delay = Duration::from_millis(200);
        let (start, times) = forward_times(|s| blocking_one_shot_delay(s, delay), 3);
        assert_eq!(times.len(), 3);
        assert!(times[0] - start >= delay);
        assert!(times[1] - times[0] < SLACK);
        assert!(times[2] - times[1] < SLACK);
    }

    #[test]
    fn test_stages_are_independent() {
        let delay = Duration::from_millis(60);
        let topology = Topology::new();
        let (publisher, source) = topology.source::<u8>();
        let (tx, rx) = unbounded();
        let first = tx.clone();
        blocking_one_shot_delay(&source, delay).sink(move |_| first.send(1).unwrap());
        blocking_one_shot_delay(&source, delay).sink(move |_| tx.send(2).unwrap());

        let start = Instant::now();
        publisher.submit(0).unwrap();
        assert!(start.elapsed() >= delay * 2);
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![1, 2]);

        let start = Instant::now();
        publisher.submit(0).unwrap();
        assert!(start.elapsed() < SLACK);
    }

    #[test]
    fn test_shutdown_interrupts_sleep() {
        let topology = Topology::new();
        let (publisher, source) = topology.source::<u8>();
        blocking_delay(&source, Duration::from_secs(30)).sink(|_| {});
        let running = topology.start().unwrap();

        let handle = thread::spawn(move || publisher.submit(1));
        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        running.shutdown().unwrap();
        assert_eq!(handle.join().unwrap(), Err(PlumbingError::Interrupted));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
