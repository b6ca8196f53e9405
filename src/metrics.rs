use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sliding window of latency samples
#[derive(Debug, Clone)]
pub struct PercentileTracker {
    samples: Arc<Mutex<VecDeque<u64>>>,
    window_size: usize,
}

impl PercentileTracker {
    pub fn new(window_size: usize) -> Self {
        Self {
            samples: Arc::new(Mutex::new(VecDeque::with_capacity(window_size))),
            window_size,
        }
    }

    /// Record a measurement in nanoseconds
    pub fn record(&self, nanos: u64) {
        let mut samples = self.samples.lock();
        if samples.len() >= self.window_size {
            samples.pop_front();
        }
        samples.push_back(nanos);
    }

    pub fn p50_us(&self) -> f64 {
        self.percentile(0.50)
    }

    pub fn p95_us(&self) -> f64 {
        self.percentile(0.95)
    }

    pub fn p99_us(&self) -> f64 {
        self.percentile(0.99)
    }

    fn percentile(&self, p: f64) -> f64 {
        let mut sorted: Vec<u64> = self.samples.lock().iter().copied().collect();
        if sorted.is_empty() {
            return 0.0;
        }
        sorted.sort_unstable();

        let idx = ((sorted.len() as f64 * p).ceil() as usize).saturating_sub(1);
        sorted[idx] as f64 / 1000.0
    }

    pub fn count(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn clear(&self) {
        self.samples.lock().clear();
    }
}

/// Counters shared by every worker of one stage
#[derive(Debug, Clone)]
pub struct StageMetrics {
    /// Completed task executions
    executions: Arc<AtomicU64>,
    /// Output pushes that found a consumer buffer full
    stalls: Arc<AtomicU64>,
    /// Executions that returned an error
    task_errors: Arc<AtomicU64>,
    /// Execute latency window
    latency: PercentileTracker,
    start_time: Arc<Mutex<Instant>>,
}

impl StageMetrics {
    pub fn new() -> Self {
        Self {
            executions: Arc::new(AtomicU64::new(0)),
            stalls: Arc::new(AtomicU64::new(0)),
            task_errors: Arc::new(AtomicU64::new(0)),
            latency: PercentileTracker::new(1000),
            start_time: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn record_execution(&self, elapsed: Duration) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        self.latency.record(elapsed.as_nanos() as u64);
    }

    pub fn record_stall(&self) {
        self.stalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_error(&self) {
        self.task_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    pub fn total_stalls(&self) -> u64 {
        self.stalls.load(Ordering::Relaxed)
    }

    pub fn total_task_errors(&self) -> u64 {
        self.task_errors.load(Ordering::Relaxed)
    }

    /// Executions per second since creation or the last reset
    pub fn throughput(&self) -> f64 {
        let elapsed = self.start_time.lock().elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.total_executions() as f64 / elapsed
        }
    }

    /// Zero every counter and restart the clock
    pub fn reset(&self) {
        self.executions.store(0, Ordering::Relaxed);
        self.stalls.store(0, Ordering::Relaxed);
        self.task_errors.store(0, Ordering::Relaxed);
        self.latency.clear();
        *self.start_time.lock() = Instant::now();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            executions: self.total_executions(),
            stalls: self.total_stalls(),
            task_errors: self.total_task_errors(),
            throughput: self.throughput(),
            latency_p50_us: self.latency.p50_us(),
            latency_p95_us: self.latency.p95_us(),
            latency_p99_us: self.latency.p99_us(),
            elapsed: self.start_time.lock().elapsed(),
        }
    }
}

impl Default for StageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`StageMetrics`]
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub executions: u64,
    pub stalls: u64,
    pub task_errors: u64,
    pub throughput: f64,
    pub latency_p50_us: f64,
    pub latency_p95_us: f64,
    pub latency_p99_us: f64,
    pub elapsed: Duration,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Executions: {}, Stalls: {}, Errors: {}, Throughput: {:.2} exec/s, \
             Latency P50: {:.2}µs, P95: {:.2}µs, P99: {:.2}µs, Elapsed: {:.2}s",
            self.executions,
            self.stalls,
            self.task_errors,
            self.throughput,
            self.latency_p50_us,
            self.latency_p95_us,
            self.latency_p99_us,
            self.elapsed.as_secs_f64()
        )
    }
}
