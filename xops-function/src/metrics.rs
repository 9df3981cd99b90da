//! Prometheus metrics for the function response cache.

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

const FUNCTION_LABEL: &str = "function_name";

/// Counters and histograms driven by the response cache, labelled by
/// function name.
#[derive(Clone)]
pub struct CacheMetrics {
    hits: IntCounterVec,
    misses: IntCounterVec,
    errors: IntCounterVec,
    writes: IntCounterVec,
    deletes: IntCounterVec,
    written_bytes: IntCounterVec,
    deleted_bytes: IntCounterVec,
    read_duration: HistogramVec,
    write_duration: HistogramVec,
}

impl CacheMetrics {
    /// Create the metrics and register them with a registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self::unregistered();
        registry.register(Box::new(metrics.hits.clone()))?;
        registry.register(Box::new(metrics.misses.clone()))?;
        registry.register(Box::new(metrics.errors.clone()))?;
        registry.register(Box::new(metrics.writes.clone()))?;
        registry.register(Box::new(metrics.deletes.clone()))?;
        registry.register(Box::new(metrics.written_bytes.clone()))?;
        registry.register(Box::new(metrics.deleted_bytes.clone()))?;
        registry.register(Box::new(metrics.read_duration.clone()))?;
        registry.register(Box::new(metrics.write_duration.clone()))?;
        Ok(metrics)
    }

    /// Create the metrics without registering them anywhere.
    pub fn unregistered() -> Self {
        let counter = |name: &str, help: &str| {
            IntCounterVec::new(Opts::new(name, help), &[FUNCTION_LABEL])
                .unwrap_or_else(|e| panic!("failed to create {name}: {e}"))
        };
        let histogram = |name: &str, help: &str| {
            HistogramVec::new(HistogramOpts::new(name, help), &[FUNCTION_LABEL])
                .unwrap_or_else(|e| panic!("failed to create {name}: {e}"))
        };
        Self {
            hits: counter(
                "function_response_cache_hits_total",
                "Responses served from cache.",
            ),
            misses: counter(
                "function_response_cache_misses_total",
                "Requests that had no fresh cached response.",
            ),
            errors: counter(
                "function_response_cache_errors_total",
                "Cache reads or writes that failed.",
            ),
            writes: counter(
                "function_response_cache_writes_total",
                "Responses written to cache.",
            ),
            deletes: counter(
                "function_response_cache_deletes_total",
                "Cached responses deleted by garbage collection.",
            ),
            written_bytes: counter(
                "function_response_cache_written_bytes_total",
                "Bytes written to cache.",
            ),
            deleted_bytes: counter(
                "function_response_cache_deleted_bytes_total",
                "Bytes deleted by garbage collection.",
            ),
            read_duration: histogram(
                "function_response_cache_read_seconds",
                "Time spent reading cache entries.",
            ),
            write_duration: histogram(
                "function_response_cache_write_seconds",
                "Time spent writing cache entries.",
            ),
        }
    }

    pub(crate) fn hit(&self, function: &str) {
        self.hits.with_label_values(&[function]).inc();
    }

    pub(crate) fn miss(&self, function: &str) {
        self.misses.with_label_values(&[function]).inc();
    }

    pub(crate) fn error(&self, function: &str) {
        self.errors.with_label_values(&[function]).inc();
    }

    pub(crate) fn wrote(&self, function: &str, bytes: u64) {
        self.writes.with_label_values(&[function]).inc();
        self.written_bytes
            .with_label_values(&[function])
            .inc_by(bytes);
    }

    pub(crate) fn deleted(&self, function: &str, bytes: u64) {
        self.deletes.with_label_values(&[function]).inc();
        self.deleted_bytes
            .with_label_values(&[function])
            .inc_by(bytes);
    }

    pub(crate) fn time_read(&self, function: &str) -> prometheus::HistogramTimer {
        self.read_duration
            .with_label_values(&[function])
            .start_timer()
    }

    pub(crate) fn time_write(&self, function: &str) -> prometheus::HistogramTimer {
        self.write_duration
            .with_label_values(&[function])
            .start_timer()
    }

    /// The hit count for a function, for tests and introspection.
    pub fn hit_count(&self, function: &str) -> u64 {
        self.hits.with_label_values(&[function]).get()
    }

    /// The miss count for a function, for tests and introspection.
    pub fn miss_count(&self, function: &str) -> u64 {
        self.misses.with_label_values(&[function]).get()
    }

    /// The error count for a function, for tests and introspection.
    pub fn error_count(&self, function: &str) -> u64 {
        self.errors.with_label_values(&[function]).get()
    }
}
