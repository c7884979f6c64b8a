//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations so concurrent ingest tasks never
//! contend on a lock. Reporting swaps the windowed counters to zero; the
//! `_total` counters are monotonic and feed the Prometheus endpoint.
//!
//! NOTE: All atomics use Relaxed ordering: these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Windowed latency histogram (sum, max and buckets reset on report)
struct LatencyWindow {
    count: AtomicU64,
    sum_us: AtomicU64,
    max_us: AtomicU64,
    buckets: [AtomicU64; NUM_BUCKETS],
}

impl LatencyWindow {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
            max_us: AtomicU64::new(0),
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    #[inline]
    fn record(&self, latency_us: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.max_us, latency_us);
    }

    fn take(&self) -> LatencySnapshot {
        let count = self.count.swap(0, Ordering::Relaxed);
        let sum = self.sum_us.swap(0, Ordering::Relaxed);
        let max_us = self.max_us.swap(0, Ordering::Relaxed);
        let buckets = swap_buckets(&self.buckets);
        LatencySnapshot {
            count,
            avg_us: if count > 0 { sum / count } else { 0 },
            max_us,
            p50_us: percentile_from_buckets(&buckets, 0.50),
            p99_us: percentile_from_buckets(&buckets, 0.99),
            buckets,
        }
    }
}

/// Point-in-time view of one latency window
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencySnapshot {
    pub count: u64,
    pub avg_us: u64,
    pub max_us: u64,
    pub p50_us: u64,
    pub p99_us: u64,
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub buckets: [u64; NUM_BUCKETS],
}

/// Lock-free metrics collector for the ingest and query paths
pub struct Metrics {
    /// Transport messages handed to the pipeline (monotonic)
    messages_received: AtomicU64,
    /// Messages received since last report (reset on report)
    messages_since_report: AtomicU64,
    /// Payloads that failed to decode (monotonic)
    decode_failed: AtomicU64,
    /// Reports that failed range/identity validation (monotonic)
    validation_failed: AtomicU64,
    /// Appends rejected by the store (monotonic)
    store_failed: AtomicU64,
    /// Reports persisted (monotonic)
    reports_stored: AtomicU64,
    /// Reports that fell inside the geofence (monotonic)
    geofence_entries: AtomicU64,
    /// Geofence events acknowledged by the broker (monotonic)
    events_published: AtomicU64,
    /// Geofence events that failed or timed out (monotonic)
    publish_failed: AtomicU64,
    /// Read API requests answered (monotonic)
    query_requests: AtomicU64,
    /// Read API requests that hit a store failure (monotonic)
    query_failed: AtomicU64,
    /// Store append latency (reset on report)
    append_latency: LatencyWindow,
    /// Publish latency including broker confirm (reset on report)
    publish_latency: LatencyWindow,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            messages_since_report: AtomicU64::new(0),
            decode_failed: AtomicU64::new(0),
            validation_failed: AtomicU64::new(0),
            store_failed: AtomicU64::new(0),
            reports_stored: AtomicU64::new(0),
            geofence_entries: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
            publish_failed: AtomicU64::new(0),
            query_requests: AtomicU64::new(0),
            query_failed: AtomicU64::new(0),
            append_latency: LatencyWindow::new(),
            publish_latency: LatencyWindow::new(),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.messages_since_report.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_decode_failed(&self) {
        self.decode_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_validation_failed(&self) {
        self.validation_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_store_failed(&self) {
        self.store_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful append with its latency (lock-free)
    #[inline]
    pub fn record_report_stored(&self, latency_us: u64) {
        self.reports_stored.fetch_add(1, Ordering::Relaxed);
        self.append_latency.record(latency_us);
    }

    #[inline]
    pub fn record_geofence_entry(&self) {
        self.geofence_entries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a confirmed publish with its latency (lock-free)
    #[inline]
    pub fn record_event_published(&self, latency_us: u64) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
        self.publish_latency.record(latency_us);
    }

    #[inline]
    pub fn record_publish_failed(&self) {
        self.publish_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_query(&self, failed: bool) {
        self.query_requests.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.query_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Monotonic counters without touching the report window
    pub fn totals(&self) -> MetricsTotals {
        MetricsTotals {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            decode_failed: self.decode_failed.load(Ordering::Relaxed),
            validation_failed: self.validation_failed.load(Ordering::Relaxed),
            store_failed: self.store_failed.load(Ordering::Relaxed),
            reports_stored: self.reports_stored.load(Ordering::Relaxed),
            geofence_entries: self.geofence_entries.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            publish_failed: self.publish_failed.load(Ordering::Relaxed),
            query_requests: self.query_requests.load(Ordering::Relaxed),
            query_failed: self.query_failed.load(Ordering::Relaxed),
        }
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        let messages_count = self.messages_since_report.swap(0, Ordering::Relaxed);
        let append = self.append_latency.take();
        let publish = self.publish_latency.take();

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let messages_per_sec = if elapsed.as_secs_f64() > 0.0 {
            messages_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary { totals: self.totals(), messages_per_sec, append, publish }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsTotals {
    pub messages_received: u64,
    pub decode_failed: u64,
    pub validation_failed: u64,
    pub store_failed: u64,
    pub reports_stored: u64,
    pub geofence_entries: u64,
    pub events_published: u64,
    pub publish_failed: u64,
    pub query_requests: u64,
    pub query_failed: u64,
}

impl MetricsTotals {
    /// Messages that never reached the store
    pub fn dropped(&self) -> u64 {
        self.decode_failed + self.validation_failed + self.store_failed
    }
}

#[derive(Debug)]
pub struct MetricsSummary {
    pub totals: MetricsTotals,
    pub messages_per_sec: f64,
    pub append: LatencySnapshot,
    pub publish: LatencySnapshot,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            messages_total = %self.totals.messages_received,
            messages_per_sec = format!("{:.1}", self.messages_per_sec),
            stored_total = %self.totals.reports_stored,
            dropped_total = %self.totals.dropped(),
            geofence_entries = %self.totals.geofence_entries,
            published_total = %self.totals.events_published,
            publish_failed = %self.totals.publish_failed,
            append_avg_us = %self.append.avg_us,
            append_p99_us = %self.append.p99_us,
            publish_p99_us = %self.publish.p99_us,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.totals(), MetricsTotals::default());
    }

    #[test]
    fn test_record_outcomes() {
        let metrics = Metrics::new();

        metrics.record_message_received();
        metrics.record_message_received();
        metrics.record_message_received();
        metrics.record_decode_failed();
        metrics.record_validation_failed();
        metrics.record_report_stored(120);
        metrics.record_geofence_entry();
        metrics.record_publish_failed();

        let totals = metrics.totals();
        assert_eq!(totals.messages_received, 3);
        assert_eq!(totals.reports_stored, 1);
        assert_eq!(totals.dropped(), 2);
        assert_eq!(totals.geofence_entries, 1);
        assert_eq!(totals.publish_failed, 1);
    }

    #[test]
    fn test_report() {
        let metrics = Metrics::new();

        metrics.record_report_stored(100);
        metrics.record_report_stored(200);
        metrics.record_report_stored(300);
        metrics.record_event_published(1000);

        let summary = metrics.report();

        assert_eq!(summary.totals.reports_stored, 3);
        assert_eq!(summary.append.count, 3);
        assert_eq!(summary.append.avg_us, 200); // (100+200+300)/3
        assert_eq!(summary.append.max_us, 300);
        assert_eq!(summary.publish.count, 1);

        // Windows reset, totals do not
        let again = metrics.report();
        assert_eq!(again.append.count, 0);
        assert_eq!(again.append.max_us, 0);
        assert_eq!(again.totals.reports_stored, 3);
    }

    #[test]
    fn test_query_counters() {
        let metrics = Metrics::new();
        metrics.record_query(false);
        metrics.record_query(true);
        let totals = metrics.totals();
        assert_eq!(totals.query_requests, 2);
        assert_eq!(totals.query_failed, 1);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let mut handles = vec![];

        // Spawn 10 threads, each recording 1000 appends
        for _ in 0..10 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    m.record_report_stored(i as u64);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.totals().reports_stored, 10_000);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(100), 0);
        assert_eq!(bucket_index(101), 1);
        assert_eq!(bucket_index(51200), 9);
        assert_eq!(bucket_index(51201), 10); // overflow
    }

    #[test]
    fn test_percentile_computation() {
        let metrics = Metrics::new();

        // 100 appends at 150µs land in bucket 1 (≤200)
        for _ in 0..100 {
            metrics.record_report_stored(150);
        }

        let summary = metrics.report();
        assert_eq!(summary.append.buckets[1], 100);
        assert_eq!(summary.append.p50_us, 200);
        assert_eq!(summary.append.p99_us, 200);
    }
}
