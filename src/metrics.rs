//! Observability metrics: query latency, write throughput, flush and
//! compaction counters.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

/// Latency samples kept for percentile estimates.
const LATENCY_WINDOW: usize = 10_000;

/// Collects runtime metrics for the engine. Shared by reference; all
/// recording methods take `&self`.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    query_latencies_us: Mutex<VecDeque<f64>>,
    total_queries: AtomicU64,
    total_inserts: AtomicU64,
    total_deletes: AtomicU64,
    cancelled_queries: AtomicU64,
    flushes: AtomicU64,
    compactions: AtomicU64,
    compactions_aborted: AtomicU64,
    files_collected: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_queries: u64,
    pub total_inserts: u64,
    pub total_deletes: u64,
    pub cancelled_queries: u64,
    pub flushes: u64,
    pub compactions: u64,
    pub compactions_aborted: u64,
    pub files_collected: u64,
    pub avg_query_latency_us: f64,
    pub p50_query_latency_us: f64,
    pub p95_query_latency_us: f64,
    pub p99_query_latency_us: f64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a query with its duration.
    pub fn record_query(&self, duration: Duration) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        let mut samples = self.query_latencies_us.lock();
        if samples.len() == LATENCY_WINDOW {
            samples.pop_front();
        }
        samples.push_back(duration.as_micros() as f64);
    }

    pub fn record_cancelled(&self) {
        self.cancelled_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insert(&self) {
        self.total_inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.total_deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compaction(&self, aborted: bool) {
        if aborted {
            self.compactions_aborted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.compactions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_collected(&self, files: usize) {
        self.files_collected.fetch_add(files as u64, Ordering::Relaxed);
    }

    pub fn total_queries(&self) -> u64 {
        self.total_queries.load(Ordering::Relaxed)
    }

    pub fn total_inserts(&self) -> u64 {
        self.total_inserts.load(Ordering::Relaxed)
    }

    pub fn total_deletes(&self) -> u64 {
        self.total_deletes.load(Ordering::Relaxed)
    }

    /// Average query latency in microseconds.
    pub fn avg_query_latency_us(&self) -> f64 {
        let samples = self.query_latencies_us.lock();
        if samples.is_empty() {
            return 0.0;
        }
        samples.iter().sum::<f64>() / samples.len() as f64
    }

    /// Get a percentile of query latency (e.g., 50.0, 95.0, 99.0).
    pub fn percentile_query_latency_us(&self, percentile: f64) -> f64 {
        let mut sorted: Vec<f64> = self.query_latencies_us.lock().iter().copied().collect();
        if sorted.is_empty() {
            return 0.0;
        }
        sorted.sort_by(|a, b| a.total_cmp(b));

        let index = ((percentile / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        sorted[index.min(sorted.len() - 1)]
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_queries: self.total_queries(),
            total_inserts: self.total_inserts(),
            total_deletes: self.total_deletes(),
            cancelled_queries: self.cancelled_queries.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
            compactions_aborted: self.compactions_aborted.load(Ordering::Relaxed),
            files_collected: self.files_collected.load(Ordering::Relaxed),
            avg_query_latency_us: self.avg_query_latency_us(),
            p50_query_latency_us: self.percentile_query_latency_us(50.0),
            p95_query_latency_us: self.percentile_query_latency_us(95.0),
            p99_query_latency_us: self.percentile_query_latency_us(99.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_basic() {
        let m = MetricsCollector::new();
        m.record_insert();
        m.record_insert();
        m.record_delete();

        assert_eq!(m.total_inserts(), 2);
        assert_eq!(m.total_deletes(), 1);
        assert_eq!(m.total_queries(), 0);
    }

    #[test]
    fn test_metrics_latency() {
        let m = MetricsCollector::new();
        m.record_query(Duration::from_micros(100));
        m.record_query(Duration::from_micros(200));
        m.record_query(Duration::from_micros(300));

        assert_eq!(m.total_queries(), 3);
        assert!((m.avg_query_latency_us() - 200.0).abs() < 1.0);
        assert!((m.percentile_query_latency_us(50.0) - 200.0).abs() < 1.0);
    }

    #[test]
    fn test_metrics_empty() {
        let m = MetricsCollector::new();
        assert_eq!(m.avg_query_latency_us(), 0.0);
        assert_eq!(m.percentile_query_latency_us(99.0), 0.0);
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let m = MetricsCollector::new();
        for _ in 0..LATENCY_WINDOW + 10 {
            m.record_query(Duration::from_micros(5));
        }
        assert_eq!(m.query_latencies_us.lock().len(), LATENCY_WINDOW);
        assert_eq!(m.total_queries(), (LATENCY_WINDOW + 10) as u64);
    }

    #[test]
    fn test_snapshot_counts_compactions() {
        let m = MetricsCollector::new();
        m.record_compaction(false);
        m.record_compaction(true);
        m.record_flush();
        m.record_collected(3);
        let s = m.snapshot();
        assert_eq!((s.compactions, s.compactions_aborted, s.flushes), (1, 1, 1));
        assert_eq!(s.files_collected, 3);
    }
}
