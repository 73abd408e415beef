//! Driver-side counters
//!
//! Lightweight atomics recorded on the send and receive paths. The harness
//! brings its own stats pipeline; these exist for log lines and post-run
//! sanity checks, not for reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Counters for one driver instance
#[derive(Debug, Default)]
pub struct DriverMetrics {
    // Producer side
    pub messages_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub send_errors: AtomicU64,
    pub send_latency_sum_us: AtomicU64,
    pub send_latency_count: AtomicU64,

    // Consumer side
    pub messages_received: AtomicU64,
    pub bytes_received: AtomicU64,

    // Session lifecycle
    pub sessions_opened: AtomicU64,
    pub sessions_failed: AtomicU64,
}

impl DriverMetrics {
    /// Record an acknowledged send
    pub fn record_send(&self, byte_count: u64, latency: Duration) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
        self.send_latency_sum_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.send_latency_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed send
    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one delivered message
    pub fn record_receive(&self, byte_count: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a successfully opened session
    pub fn record_session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed session open
    pub fn record_session_failed(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Average acknowledged-send latency in microseconds
    pub fn average_send_latency_us(&self) -> f64 {
        let sum = self.send_latency_sum_us.load(Ordering::Relaxed);
        let count = self.send_latency_count.load(Ordering::Relaxed);

        if count == 0 {
            0.0
        } else {
            sum as f64 / count as f64
        }
    }

    /// Get a point-in-time snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            average_send_latency_us: self.average_send_latency_us(),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of driver counters at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
    pub average_send_latency_us: f64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub sessions_opened: u64,
    pub sessions_failed: u64,
}

/// Timing helper for measuring operation latency
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(self) -> Duration {
        self.start.elapsed()
    }
}

/// Global metrics instance
static GLOBAL_METRICS: once_cell::sync::Lazy<Arc<DriverMetrics>> =
    once_cell::sync::Lazy::new(|| Arc::new(DriverMetrics::default()));

/// Get the global metrics instance
pub fn global_metrics() -> Arc<DriverMetrics> {
    GLOBAL_METRICS.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_accounting() {
        let metrics = DriverMetrics::default();
        metrics.record_send(100, Duration::from_micros(50));
        metrics.record_send(200, Duration::from_micros(150));
        metrics.record_send_error();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_sent, 2);
        assert_eq!(snapshot.bytes_sent, 300);
        assert_eq!(snapshot.send_errors, 1);
        assert!((snapshot.average_send_latency_us - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_latency_is_zero() {
        let metrics = DriverMetrics::default();
        assert_eq!(metrics.average_send_latency_us(), 0.0);
    }
}
