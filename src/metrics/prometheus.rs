//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by idat-forge and provides
//! functions for initializing, registering, and exporting metrics. A run is a
//! short-lived batch job, so metrics are exported as a text file at the end of
//! the run rather than scraped.

use std::path::Path;
use std::sync::{Mutex, OnceLock};

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

/// Global Prometheus registry for all idat-forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Samples processed, labeled by outcome and failure kind.
pub static SAMPLES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Per-sample processing duration in seconds, labeled by orchestration mode.
pub static SAMPLE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Batches processed, labeled by status.
pub static BATCHES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Retries of remote operations, labeled by operation.
pub static RETRIES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Genotype caller invocations, labeled by mode and status.
pub static CALLER_INVOCATIONS: OnceLock<CounterVec> = OnceLock::new();

/// Number of work units currently in flight.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once; later calls keep the first registry.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let samples_total = CounterVec::new(
        Opts::new("idat_forge_samples_total", "Total number of samples processed"),
        &["outcome", "kind"],
    )?;

    let sample_duration = HistogramVec::new(
        HistogramOpts::new(
            "idat_forge_sample_duration_seconds",
            "Per-sample processing duration in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0]),
        &["mode"],
    )?;

    let batches_total = CounterVec::new(
        Opts::new("idat_forge_batches_total", "Total number of batches processed"),
        &["status"],
    )?;

    let retries_total = CounterVec::new(
        Opts::new("idat_forge_retries_total", "Retries of remote operations"),
        &["operation"],
    )?;

    let caller_invocations = CounterVec::new(
        Opts::new(
            "idat_forge_caller_invocations_total",
            "Genotype caller invocations",
        ),
        &["mode", "status"],
    )?;

    let active_workers = Gauge::new(
        "idat_forge_active_workers",
        "Number of work units currently in flight",
    )?;

    registry.register(Box::new(samples_total.clone()))?;
    registry.register(Box::new(sample_duration.clone()))?;
    registry.register(Box::new(batches_total.clone()))?;
    registry.register(Box::new(retries_total.clone()))?;
    registry.register(Box::new(caller_invocations.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // If any of these fail, metrics were already initialized
    let _ = REGISTRY.set(registry);
    let _ = SAMPLES_TOTAL.set(samples_total);
    let _ = SAMPLE_DURATION.set(sample_duration);
    let _ = BATCHES_TOTAL.set(batches_total);
    let _ = RETRIES_TOTAL.set(retries_total);
    let _ = CALLER_INVOCATIONS.set(caller_invocations);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// Writes the current metrics to `path` (node-exporter textfile format).
pub async fn write_metrics_file(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(path, export_metrics()).await
}
