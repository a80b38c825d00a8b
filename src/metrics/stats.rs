use hdrhistogram::Histogram;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// Consumer-side counters and report age histogram.
pub struct Stats {
    // Receive time minus last egress timestamp (nanoseconds)
    latency_hist: RwLock<Histogram<u64>>,

    pub received_count: RwLock<u64>,
    pub decode_errors: RwLock<u64>,
    pub read_errors: RwLock<u64>,

    start_time: Instant,
    last_snapshot: RwLock<(Instant, u64)>,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        let now = Instant::now();
        // 1ns to 60s, 3 significant digits; grows for older reports
        let mut hist = Histogram::new_with_bounds(1, 60_000_000_000, 3)
            .expect("static histogram bounds are valid");
        hist.auto(true);
        Self {
            latency_hist: RwLock::new(hist),
            received_count: RwLock::new(0),
            decode_errors: RwLock::new(0),
            read_errors: RwLock::new(0),
            start_time: now,
            last_snapshot: RwLock::new((now, 0)),
        }
    }

    /// Record a decoded report; `latency_ns` is present when the report
    /// carried an egress timestamp.
    pub async fn record_received(&self, latency_ns: Option<u64>) {
        *self.received_count.write().await += 1;
        if let Some(lat) = latency_ns {
            let _ = self.latency_hist.write().await.record(lat.max(1));
        }
    }

    pub async fn record_decode_error(&self) {
        *self.decode_errors.write().await += 1;
    }

    pub async fn record_read_error(&self) {
        *self.read_errors.write().await += 1;
    }

    pub async fn snapshot(&self) -> StatsSnapshot {
        let now = Instant::now();
        let received = *self.received_count.read().await;
        let decode_errors = *self.decode_errors.read().await;
        let read_errors = *self.read_errors.read().await;

        let hist = self.latency_hist.read().await;
        let (p50, p95, p99, max) = if hist.is_empty() {
            (0, 0, 0, 0)
        } else {
            (
                hist.value_at_quantile(0.5),
                hist.value_at_quantile(0.95),
                hist.value_at_quantile(0.99),
                hist.max(),
            )
        };
        drop(hist);

        let (interval_duration, interval_received) = {
            let mut last = self.last_snapshot.write().await;
            let d = now.duration_since(last.0);
            let n = received - last.1;
            *last = (now, received);
            (d, n)
        };

        StatsSnapshot {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            received_count: received,
            decode_errors,
            read_errors,
            total_duration: now.duration_since(self.start_time),
            interval_duration,
            interval_received,
            latency_ns_p50: p50,
            latency_ns_p95: p95,
            latency_ns_p99: p99,
            latency_ns_max: max,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub timestamp: u64,
    pub received_count: u64,
    pub decode_errors: u64,
    pub read_errors: u64,
    pub total_duration: Duration,
    pub interval_duration: Duration,
    pub interval_received: u64,
    pub latency_ns_p50: u64,
    pub latency_ns_p95: u64,
    pub latency_ns_p99: u64,
    pub latency_ns_max: u64,
}

impl StatsSnapshot {
    /// Reports per second since the previous snapshot
    pub fn interval_throughput(&self) -> f64 {
        let secs = self.interval_duration.as_secs_f64();
        if secs > 0.0 {
            self.interval_received as f64 / secs
        } else {
            0.0
        }
    }

    pub fn total_throughput(&self) -> f64 {
        let secs = self.total_duration.as_secs_f64();
        if secs > 0.0 {
            self.received_count as f64 / secs
        } else {
            0.0
        }
    }

    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{},{},{},{:.2},{:.2},{},{},{},{}",
            self.timestamp,
            self.received_count,
            self.decode_errors,
            self.read_errors,
            self.total_throughput(),
            self.interval_throughput(),
            self.latency_ns_p50,
            self.latency_ns_p95,
            self.latency_ns_p99,
            self.latency_ns_max
        )
    }

    pub fn csv_header() -> &'static str {
        "timestamp,received_count,decode_errors,read_errors,total_throughput,interval_throughput,latency_ns_p50,latency_ns_p95,latency_ns_p99,latency_ns_max"
    }
}
