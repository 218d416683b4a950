//! Simple metrics collection for observability
//!
//! Lightweight atomic counters for the three protection layers, exported in
//! Prometheus text format on `GET /metrics`.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bulwark::BackpressureStats;

/// Counters shared by the guard, the rate limiter and the cache layer
pub struct Metrics {
    start_time: Instant,

    /// Backpressure decisions
    pub requests_admitted: AtomicU64,
    pub requests_over_capacity: AtomicU64,

    /// Rate limiting decisions
    pub rate_allowed: AtomicU64,
    pub rate_denied: AtomicU64,
    pub rate_fail_open: AtomicU64,

    /// Cache outcomes
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_errors: AtomicU64,
    pub cache_slow_writes: AtomicU64,
    pub cache_keys_invalidated: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            requests_admitted: AtomicU64::new(0),
            requests_over_capacity: AtomicU64::new(0),
            rate_allowed: AtomicU64::new(0),
            rate_denied: AtomicU64::new(0),
            rate_fail_open: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            cache_errors: AtomicU64::new(0),
            cache_slow_writes: AtomicU64::new(0),
            cache_keys_invalidated: AtomicU64::new(0),
        }
    }

    pub fn record_admission(&self, admitted: bool) {
        if admitted {
            self.requests_admitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_over_capacity.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a rate limit decision
    ///
    /// Fail-open decisions count as allowed and as fail-open.
    pub fn record_rate_decision(&self, allowed: bool, fail_open: bool) {
        if allowed {
            self.rate_allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rate_denied.fetch_add(1, Ordering::Relaxed);
        }
        if fail_open {
            self.rate_fail_open.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_cache_error(&self) {
        self.cache_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_slow_write(&self) {
        self.cache_slow_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidated(&self, removed: u64) {
        self.cache_keys_invalidated
            .fetch_add(removed, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Export metrics in Prometheus text format
    ///
    /// Gauges that live outside this struct (backpressure occupancy, store
    /// health) are passed in by the caller.
    pub fn export_prometheus(&self, backpressure: &BackpressureStats, store_healthy: bool) -> String {
        let mut output = String::with_capacity(2048);

        gauge(
            &mut output,
            "bulwark_uptime_seconds",
            "Time since server start in seconds",
            self.uptime_seconds(),
        );

        counter(
            &mut output,
            "bulwark_requests_admitted_total",
            "Requests admitted by the concurrency gate",
            load(&self.requests_admitted),
        );
        counter(
            &mut output,
            "bulwark_requests_over_capacity_total",
            "Requests rejected by the concurrency gate",
            load(&self.requests_over_capacity),
        );
        gauge(
            &mut output,
            "bulwark_requests_active",
            "Requests currently in flight",
            backpressure.active as u64,
        );
        gauge(
            &mut output,
            "bulwark_requests_max",
            "Maximum concurrent requests",
            backpressure.max as u64,
        );

        counter(
            &mut output,
            "bulwark_ratelimit_allowed_total",
            "Requests allowed by the rate limiter",
            load(&self.rate_allowed),
        );
        counter(
            &mut output,
            "bulwark_ratelimit_denied_total",
            "Requests denied by the rate limiter",
            load(&self.rate_denied),
        );
        counter(
            &mut output,
            "bulwark_ratelimit_fail_open_total",
            "Requests allowed because the store could not be consulted",
            load(&self.rate_fail_open),
        );

        counter(
            &mut output,
            "bulwark_cache_hits_total",
            "Cache lookups that returned a value",
            load(&self.cache_hits),
        );
        counter(
            &mut output,
            "bulwark_cache_misses_total",
            "Cache lookups that returned nothing",
            load(&self.cache_misses),
        );
        counter(
            &mut output,
            "bulwark_cache_errors_total",
            "Cache operations that failed",
            load(&self.cache_errors),
        );
        counter(
            &mut output,
            "bulwark_cache_slow_writes_total",
            "Cache writes slower than the configured threshold",
            load(&self.cache_slow_writes),
        );
        counter(
            &mut output,
            "bulwark_cache_keys_invalidated_total",
            "Keys removed by pattern invalidation",
            load(&self.cache_keys_invalidated),
        );

        gauge(
            &mut output,
            "bulwark_store_healthy",
            "Whether the coordination store connection is ready",
            u64::from(store_healthy),
        );

        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn load(value: &AtomicU64) -> u64 {
    value.load(Ordering::Relaxed)
}

fn counter(output: &mut String, name: &str, help: &str, value: u64) {
    metric(output, name, help, "counter", value);
}

fn gauge(output: &mut String, name: &str, help: &str, value: u64) {
    metric(output, name, help, "gauge", value);
}

fn metric(output: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    // Writing into a String cannot fail
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {kind}");
    let _ = writeln!(output, "{name} {value}\n");
}
