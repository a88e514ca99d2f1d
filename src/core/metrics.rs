//! Pool statistics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Window over which `throughput_per_minute` is computed.
const THROUGHPUT_WINDOW: Duration = Duration::from_secs(60);

/// Latency samples retained for percentile estimates.
const LATENCY_SAMPLES: usize = 1024;

/// Snapshot of pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyMetrics {
    /// Workers currently serving a request.
    pub active_workers: usize,
    /// Workers ready for a request.
    pub idle_workers: usize,
    /// Requests waiting in the scheduler.
    pub queue_depth: usize,
    /// Requests that received a worker reply.
    pub total_processed: u64,
    /// Requests that failed after admission, including worker-reported errors.
    pub total_errors: u64,
    /// Mean latency over the sample window, in ms.
    pub avg_latency_ms: f64,
    /// 95th percentile latency, in ms.
    pub p95_latency_ms: u64,
    /// 99th percentile latency, in ms.
    pub p99_latency_ms: u64,
    /// Replies received during the last minute.
    pub throughput_per_minute: u64,
    /// Queue load as a fraction of the hard cap.
    pub backpressure_level: f64,
    /// Workers flagged stuck and awaiting termination.
    pub stuck_workers: usize,
}

/// Lock-free outcome counters.
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub total_processed: AtomicU64,
    pub total_errors: AtomicU64,
}

impl PoolCounters {
    pub fn record_processed(&self, failed: bool) {
        self.total_processed.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_error(&self) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Bounded ring of recent latencies.
#[derive(Debug)]
pub(crate) struct LatencyWindow {
    samples: VecDeque<(Instant, u64)>,
    capacity: usize,
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::with_capacity(LATENCY_SAMPLES)
    }
}

impl LatencyWindow {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(LATENCY_SAMPLES)),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, at: Instant, latency_ms: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((at, latency_ms));
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let total: u64 = self.samples.iter().map(|(_, ms)| ms).sum();
        total as f64 / self.samples.len() as f64
    }

    /// Nearest-rank percentile, `pct` in `(0, 100]`.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn percentile(&self, pct: f64) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u64> = self.samples.iter().map(|(_, ms)| *ms).collect();
        sorted.sort_unstable();
        let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
        sorted[rank.clamp(1, sorted.len()) - 1]
    }

    pub fn throughput(&self, now: Instant) -> u64 {
        self.samples
            .iter()
            .rev()
            .take_while(|(at, _)| now.saturating_duration_since(*at) <= THROUGHPUT_WINDOW)
            .count() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_default_zeroed() {
        let m = ConcurrencyMetrics::default();
        assert_eq!(m.active_workers, 0);
        assert_eq!(m.total_processed, 0);
        assert!((m.avg_latency_ms - 0.0).abs() < f64::EPSILON);
        assert!((m.backpressure_level - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_counters() {
        let c = PoolCounters::default();
        c.record_processed(false);
        c.record_processed(true);
        c.record_error();
        assert_eq!(c.total_processed.load(Ordering::Relaxed), 2);
        assert_eq!(c.total_errors.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_percentiles() {
        let now = Instant::now();
        let mut w = LatencyWindow::default();
        assert_eq!(w.percentile(95.0), 0);
        for ms in 1..=100 {
            w.record(now, ms);
        }
        assert!((w.average() - 50.5).abs() < f64::EPSILON);
        assert_eq!(w.percentile(95.0), 95);
        assert_eq!(w.percentile(99.0), 99);
        assert_eq!(w.percentile(100.0), 100);
    }

    #[test]
    fn test_window_is_bounded() {
        let now = Instant::now();
        let mut w = LatencyWindow::with_capacity(3);
        for ms in [10, 20, 30, 40] {
            w.record(now, ms);
        }
        assert!((w.average() - 30.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throughput_window() {
        let mut w = LatencyWindow::default();
        w.record(Instant::now(), 5);
        tokio::time::advance(Duration::from_secs(61)).await;
        w.record(Instant::now(), 5);
        w.record(Instant::now(), 5);
        assert_eq!(w.throughput(Instant::now()), 2);
    }
}
