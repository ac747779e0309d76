//! Metrics collection
//!
//! Prometheus-compatible text output with:
//! - Request counters by command and backend store
//! - Error counters, including mirrored-write failures
//! - End-to-end latency histograms per command

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

/// A simple histogram implementation for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Create a new histogram with default latency buckets
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    /// Create a histogram with custom bucket boundaries
    pub fn with_buckets(boundaries: &[f64]) -> Self {
        let mut buckets = Vec::with_capacity(boundaries.len() + 1);
        for _ in 0..=boundaries.len() {
            buckets.push(AtomicU64::new(0));
        }
        Self {
            buckets,
            boundaries: boundaries.to_vec(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value in the histogram
    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .boundaries
            .iter()
            .position(|&boundary| value <= boundary)
            .unwrap_or(self.boundaries.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        // Stored as thousandths for precision
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative bucket counts, ending with +Inf
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);

        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }

        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));

        result
    }

    pub fn sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Counter for tracking request counts
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge for tracking current values
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Per (command, store) metrics
#[derive(Debug, Default)]
pub struct CommandMetrics {
    pub requests_total: Counter,
    pub requests_error: Counter,
    pub latency: Histogram,
}

/// Global metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    commands: Mutex<BTreeMap<(String, String), Arc<CommandMetrics>>>,

    /// Mirrored writes that failed on the non-primary backend
    pub dual_write_errors: Counter,
    /// Writes that had to engage backup nodes
    pub backup_writes: Counter,
    /// CLOSED → OPEN breaker transitions
    pub breaker_trips: Counter,
    pub active_connections: Gauge,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            commands: Mutex::new(BTreeMap::new()),
            dual_write_errors: Counter::new(),
            backup_writes: Counter::new(),
            breaker_trips: Counter::new(),
            active_connections: Gauge::new(),
            start_time: Instant::now(),
        }
    }

    /// Get or create metrics for a command on a store
    pub fn command(&self, cmd: &str, store: &str) -> Arc<CommandMetrics> {
        let mut commands = match self.commands.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        commands
            .entry((cmd.to_string(), store.to_string()))
            .or_default()
            .clone()
    }

    /// Record one command served by a store
    pub fn record(&self, cmd: &str, store: &str, duration: Duration, success: bool) {
        let metrics = self.command(cmd, store);
        metrics.requests_total.inc();
        metrics.latency.observe(duration.as_secs_f64() * 1000.0);
        if !success {
            metrics.requests_error.inc();
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP beanproxy_dual_write_errors_total Failed mirrored writes\n");
        out.push_str("# TYPE beanproxy_dual_write_errors_total counter\n");
        let _ = writeln!(
            out,
            "beanproxy_dual_write_errors_total {}",
            self.dual_write_errors.get()
        );

        out.push_str("# HELP beanproxy_backup_writes_total Writes that engaged backup nodes\n");
        out.push_str("# TYPE beanproxy_backup_writes_total counter\n");
        let _ = writeln!(out, "beanproxy_backup_writes_total {}", self.backup_writes.get());

        out.push_str("# HELP beanproxy_breaker_trips_total Circuit breaker openings\n");
        out.push_str("# TYPE beanproxy_breaker_trips_total counter\n");
        let _ = writeln!(out, "beanproxy_breaker_trips_total {}", self.breaker_trips.get());

        out.push_str("# HELP beanproxy_active_connections Open client connections\n");
        out.push_str("# TYPE beanproxy_active_connections gauge\n");
        let _ = writeln!(
            out,
            "beanproxy_active_connections {}",
            self.active_connections.get()
        );

        out.push_str("# HELP beanproxy_uptime_seconds Server uptime in seconds\n");
        out.push_str("# TYPE beanproxy_uptime_seconds gauge\n");
        let _ = writeln!(out, "beanproxy_uptime_seconds {}", self.uptime_seconds());

        let commands = match self.commands.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        out.push_str("# HELP beanproxy_total_reqs Requests per command and store\n");
        out.push_str("# TYPE beanproxy_total_reqs counter\n");
        for ((cmd, store), metrics) in commands.iter() {
            let _ = writeln!(
                out,
                "beanproxy_total_reqs{{cmd=\"{}\",store=\"{}\"}} {}",
                cmd,
                store,
                metrics.requests_total.get()
            );
        }

        out.push_str("# HELP beanproxy_error_reqs Failed requests per command and store\n");
        out.push_str("# TYPE beanproxy_error_reqs counter\n");
        for ((cmd, store), metrics) in commands.iter() {
            let _ = writeln!(
                out,
                "beanproxy_error_reqs{{cmd=\"{}\",store=\"{}\"}} {}",
                cmd,
                store,
                metrics.requests_error.get()
            );
        }

        out.push_str("# HELP beanproxy_cmd_duration_ms Command duration in milliseconds\n");
        out.push_str("# TYPE beanproxy_cmd_duration_ms histogram\n");
        for ((cmd, store), metrics) in commands.iter() {
            for (le, count) in metrics.latency.get_buckets() {
                let le = if le.is_infinite() {
                    "+Inf".to_string()
                } else {
                    le.to_string()
                };
                let _ = writeln!(
                    out,
                    "beanproxy_cmd_duration_ms_bucket{{cmd=\"{}\",store=\"{}\",le=\"{}\"}} {}",
                    cmd, store, le, count
                );
            }
            let _ = writeln!(
                out,
                "beanproxy_cmd_duration_ms_sum{{cmd=\"{}\",store=\"{}\"}} {}",
                cmd,
                store,
                metrics.latency.sum()
            );
            let _ = writeln!(
                out,
                "beanproxy_cmd_duration_ms_count{{cmd=\"{}\",store=\"{}\"}} {}",
                cmd,
                store,
                metrics.latency.count()
            );
        }

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<MetricsRegistry> =
    once_cell::sync::Lazy::new(MetricsRegistry::new);
