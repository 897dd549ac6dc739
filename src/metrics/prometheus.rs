//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by the pool and provides
//! functions for initializing, registering, and exporting them.

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::path::Path;
use std::sync::{Mutex, OnceLock};

/// Global Prometheus registry for all pool metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of resolved jobs, labeled by queue and status.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Job process duration in seconds, labeled by queue.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Total failed poll attempts (transport errors and malformed entries), labeled by queue.
pub static POLL_ERRORS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of jobs currently executing in this process.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of registered workers in this process.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once; later calls leave the first registry in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric creation or registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let jobs_total = CounterVec::new(
        Opts::new("resque_pool_jobs_total", "Total number of resolved jobs"),
        &["queue", "status"],
    )?;

    let job_duration = HistogramVec::new(
        HistogramOpts::new(
            "resque_pool_job_duration_seconds",
            "Job process duration in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 1800.0]),
        &["queue"],
    )?;

    let poll_errors_total = CounterVec::new(
        Opts::new("resque_pool_poll_errors_total", "Total failed poll attempts"),
        &["queue"],
    )?;

    let jobs_in_progress = Gauge::new(
        "resque_pool_jobs_in_progress",
        "Number of jobs currently executing",
    )?;

    let active_workers = Gauge::new("resque_pool_active_workers", "Number of registered workers")?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(poll_errors_total.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = POLL_ERRORS_TOTAL.set(poll_errors_total);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead if the registry is not initialized or
/// encoding fails.
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

/// Writes the current metrics to `path` for a textfile collector.
///
/// The file is written next to its destination and renamed into place so a
/// scraper never reads a partial file.
pub async fn write_textfile(path: &Path) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");

    tokio::fs::write(&tmp, export_metrics()).await?;
    tokio::fs::rename(&tmp, path).await
}
