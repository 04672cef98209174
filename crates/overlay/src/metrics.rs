//! Transport metrics.
//!
//! One [`OverlayMetrics`] instance is shared (via `Arc`) by every peer the
//! process owns; all fields are atomic, so recording never takes a lock.
//! Alongside the plain read/write/error counters there are two latency
//! timers fed by the write pipeline: how long a message sat in the outbound
//! queue, and how long its socket write took.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Atomic event counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Creates a counter starting at 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the counter by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the counter by `n`.
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Returns the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Latency accumulator tracking count, total, min, and max.
#[derive(Debug)]
pub struct Timer {
    total_us: AtomicU64,
    count: AtomicU64,
    min_us: AtomicU64,
    max_us: AtomicU64,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    /// Creates an empty timer.
    pub fn new() -> Self {
        Self {
            total_us: AtomicU64::new(0),
            count: AtomicU64::new(0),
            min_us: AtomicU64::new(u64::MAX),
            max_us: AtomicU64::new(0),
        }
    }

    /// Records one observation.
    pub fn record(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.total_us.fetch_add(us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.min_us.fetch_min(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    /// Number of recorded observations.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Mean duration, or zero if nothing was recorded.
    pub fn avg_duration(&self) -> Duration {
        let count = self.count();
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_us.load(Ordering::Relaxed) / count)
    }

    /// Point-in-time view of the timer.
    pub fn snapshot(&self) -> TimerSnapshot {
        let min = self.min_us.load(Ordering::Relaxed);
        TimerSnapshot {
            count: self.count(),
            total: Duration::from_micros(self.total_us.load(Ordering::Relaxed)),
            avg: self.avg_duration(),
            min: if min == u64::MAX {
                Duration::ZERO
            } else {
                Duration::from_micros(min)
            },
            max: Duration::from_micros(self.max_us.load(Ordering::Relaxed)),
        }
    }
}

/// Snapshot of a [`Timer`].
#[derive(Debug, Clone)]
pub struct TimerSnapshot {
    /// Number of observations.
    pub count: u64,
    /// Sum of all observations.
    pub total: Duration,
    /// Mean observation.
    pub avg: Duration,
    /// Smallest observation.
    pub min: Duration,
    /// Largest observation.
    pub max: Duration,
}

/// Metrics for the per-peer transport.
#[derive(Debug, Default)]
pub struct OverlayMetrics {
    /// Complete messages assembled from peers.
    pub messages_read: Counter,
    /// Messages whose socket write completed.
    pub messages_written: Counter,
    /// Bytes received from peers.
    pub bytes_read: Counter,
    /// Bytes written to peers.
    pub bytes_written: Counter,
    /// Read-side failures, including size-limit violations.
    pub errors_read: Counter,
    /// Write-side failures on established peers.
    pub errors_write: Counter,
    /// Peers dropped for idling.
    pub timeouts_idle: Counter,
    /// Peers dropped because their write queue would not drain.
    pub timeouts_straggler: Counter,
    /// Socket reads issued after the buffered drain ran dry.
    pub async_reads: Counter,
    /// Time messages spent queued before their write was issued.
    pub write_queue_delay: Timer,
    /// Time the socket write itself took.
    pub async_write_delay: Timer,
}

impl OverlayMetrics {
    /// Creates a metrics instance with everything at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time view of all metrics.
    pub fn snapshot(&self) -> OverlayMetricsSnapshot {
        OverlayMetricsSnapshot {
            messages_read: self.messages_read.get(),
            messages_written: self.messages_written.get(),
            bytes_read: self.bytes_read.get(),
            bytes_written: self.bytes_written.get(),
            errors_read: self.errors_read.get(),
            errors_write: self.errors_write.get(),
            timeouts_idle: self.timeouts_idle.get(),
            timeouts_straggler: self.timeouts_straggler.get(),
            async_reads: self.async_reads.get(),
            write_queue_delay: self.write_queue_delay.snapshot(),
            async_write_delay: self.async_write_delay.snapshot(),
        }
    }
}

/// Snapshot of [`OverlayMetrics`] at a point in time.
#[derive(Debug, Clone)]
pub struct OverlayMetricsSnapshot {
    pub messages_read: u64,
    pub messages_written: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub errors_read: u64,
    pub errors_write: u64,
    pub timeouts_idle: u64,
    pub timeouts_straggler: u64,
    pub async_reads: u64,
    pub write_queue_delay: TimerSnapshot,
    pub async_write_delay: TimerSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn counter_basic() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);

        counter.inc();
        counter.add(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn counter_concurrent() {
        let counter = Counter::new();
        let counter_ref = &counter;

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        counter_ref.inc();
                    }
                });
            }
        });

        assert_eq!(counter.get(), 8000);
    }

    #[test]
    fn timer_records_min_max() {
        let timer = Timer::new();
        timer.record(Duration::from_micros(100));
        timer.record(Duration::from_micros(300));
        timer.record(Duration::from_micros(200));

        let snapshot = timer.snapshot();
        assert_eq!(snapshot.count, 3);
        assert_eq!(snapshot.total, Duration::from_micros(600));
        assert_eq!(snapshot.avg, Duration::from_micros(200));
        assert_eq!(snapshot.min, Duration::from_micros(100));
        assert_eq!(snapshot.max, Duration::from_micros(300));
    }

    #[test]
    fn empty_timer_snapshot() {
        let timer = Timer::new();
        let snapshot = timer.snapshot();
        assert_eq!(snapshot.count, 0);
        assert_eq!(snapshot.avg, Duration::ZERO);
        assert_eq!(snapshot.min, Duration::ZERO);
        assert_eq!(snapshot.max, Duration::ZERO);
    }

    #[test]
    fn metrics_snapshot() {
        let metrics = OverlayMetrics::new();
        metrics.messages_read.add(10);
        metrics.bytes_written.add(4096);
        metrics.errors_read.inc();
        metrics.write_queue_delay.record(Duration::from_millis(1));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_read, 10);
        assert_eq!(snapshot.bytes_written, 4096);
        assert_eq!(snapshot.errors_read, 1);
        assert_eq!(snapshot.write_queue_delay.count, 1);
    }
}
