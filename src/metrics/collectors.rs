//! Custom metric collectors for idat-forge operations.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics with methods named
//! after pipeline events. Every method is a no-op until `init_metrics()` has
//! run, so library code can record unconditionally.

use super::prometheus::{
    ACTIVE_WORKERS, BATCHES_TOTAL, CALLER_INVOCATIONS, RETRIES_TOTAL, SAMPLES_TOTAL,
    SAMPLE_DURATION,
};

/// Metrics collector for recording pipeline events.
///
/// # Example
///
/// ```ignore
/// use idat_forge::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_sample_success("batch-wide", 42.0);
/// collector.record_sample_failure("retrieval");
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a sample whose table was written.
    pub fn record_sample_success(&self, mode: &str, duration_secs: f64) {
        if let Some(samples_total) = SAMPLES_TOTAL.get() {
            samples_total.with_label_values(&["success", "none"]).inc();
        }

        if let Some(sample_duration) = SAMPLE_DURATION.get() {
            sample_duration
                .with_label_values(&[mode])
                .observe(duration_secs);
        }

        tracing::trace!(
            mode = mode,
            duration_secs = duration_secs,
            "Recorded sample success"
        );
    }

    /// Record a failed sample with its failure kind.
    pub fn record_sample_failure(&self, kind: &str) {
        if let Some(samples_total) = SAMPLES_TOTAL.get() {
            samples_total.with_label_values(&["failure", kind]).inc();
        }

        tracing::trace!(kind = kind, "Recorded sample failure");
    }

    /// Record the end of a batch (`success`, `partial` or `fatal`).
    pub fn record_batch(&self, status: &str) {
        if let Some(batches_total) = BATCHES_TOTAL.get() {
            batches_total.with_label_values(&[status]).inc();
        }
    }

    /// Record one retry of a remote operation.
    pub fn record_retry(&self, operation: &str) {
        if let Some(retries_total) = RETRIES_TOTAL.get() {
            retries_total.with_label_values(&[operation]).inc();
        }
    }

    /// Record a genotype caller invocation.
    pub fn record_caller(&self, mode: &str, success: bool) {
        let status = if success { "success" } else { "failure" };
        if let Some(invocations) = CALLER_INVOCATIONS.get() {
            invocations.with_label_values(&[mode, status]).inc();
        }
    }

    /// Set the number of units in flight.
    pub fn set_active_workers(&self, count: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(count as f64);
        }
    }
}
