use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Forward latencies kept per stage for percentiles
const LATENCY_WINDOW: usize = 1024;

/// Ring of the most recent forward latencies, in nanoseconds
#[derive(Debug, Default)]
struct LatencyRing {
    samples: Vec<u64>,
    next: usize,
}

impl LatencyRing {
    fn record(&mut self, latency: Duration) {
        let nanos = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        if self.samples.len() < LATENCY_WINDOW {
            self.samples.push(nanos);
        } else {
            self.samples[self.next] = nanos;
        }
        self.next = (self.next + 1) % LATENCY_WINDOW;
    }

    /// Nearest-rank quantile `q` (0.0..=1.0) in microseconds; 0 when empty
    fn quantile_us(&self, q: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let rank = (sorted.len() as f64 * q).ceil() as usize;
        sorted[rank.clamp(1, sorted.len()) - 1] as f64 / 1000.0
    }
}

/// Counters for one isolating stage.
///
/// `forwarded` counts tuples handed downstream by the stage's workers,
/// `dropped` counts tuples evicted by pressure relief and `blocked` counts
/// producer pushes that had to wait for space. Latency is the time a worker
/// spends delivering one tuple downstream.
#[derive(Debug, Clone)]
pub struct StageMetrics {
    forwarded: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    blocked: Arc<AtomicU64>,
    latency: Arc<Mutex<LatencyRing>>,
    start_time: Instant,
}

impl StageMetrics {
    /// Create an empty collector
    pub fn new() -> Self {
        Self {
            forwarded: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            blocked: Arc::new(AtomicU64::new(0)),
            latency: Arc::new(Mutex::new(LatencyRing::default())),
            start_time: Instant::now(),
        }
    }

    /// Count one tuple delivered downstream in `elapsed`
    pub fn record_forwarded(&self, elapsed: Duration) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        self.latency.lock().record(elapsed);
    }

    /// Count one tuple discarded by pressure relief
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one push that found the stage full
    pub fn record_blocked(&self) {
        self.blocked.fetch_add(1, Ordering::Relaxed);
    }

    /// Tuples delivered downstream so far
    pub fn total_forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Tuples discarded so far
    pub fn total_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Pushes that had to wait for space
    pub fn total_blocked(&self) -> u64 {
        self.blocked.load(Ordering::Relaxed)
    }

    /// Tuples forwarded per second since the stage was wired
    pub fn throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.total_forwarded() as f64 / elapsed
        }
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency = self.latency.lock();
        MetricsSnapshot {
            forwarded: self.total_forwarded(),
            dropped: self.total_dropped(),
            blocked: self.total_blocked(),
            throughput: self.throughput(),
            latency_p50_us: latency.quantile_us(0.50),
            latency_p99_us: latency.quantile_us(0.99),
            elapsed: self.start_time.elapsed(),
        }
    }
}

impl Default for StageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of stage metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub forwarded: u64,
    pub dropped: u64,
    pub blocked: u64,
    pub throughput: f64,
    pub latency_p50_us: f64,
    pub latency_p99_us: f64,
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    /// Format metrics as a human-readable string
    pub fn format(&self) -> String {
        format!(
            "Forwarded: {}, Dropped: {}, Blocked: {}, Throughput: {:.2} tuples/s, \
             Latency P50: {:.2}µs, P99: {:.2}µs, Elapsed: {:.2}s",
            self.forwarded,
            self.dropped,
            self.blocked,
            self.throughput,
            self.latency_p50_us,
            self.latency_p99_us,
            self.elapsed.as_secs_f64()
        )
    }
}
