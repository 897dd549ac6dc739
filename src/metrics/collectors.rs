//! Recording helpers over the raw Prometheus metrics.

use super::prometheus::{
    ACTIVE_WORKERS, JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION, POLL_ERRORS_TOTAL,
};

/// How a job resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Succeeded => "succeeded",
            JobOutcome::Failed => "failed",
        }
    }
}

/// Metrics collector used by workers.
///
/// Every method is a no-op until `init_metrics()` has been called, so
/// library users that never export metrics pay nothing for them.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a resolved job.
    pub fn record_job(&self, queue: &str, outcome: JobOutcome, duration_secs: f64) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total
                .with_label_values(&[queue, outcome.as_str()])
                .inc();
        }

        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration.with_label_values(&[queue]).observe(duration_secs);
        }

        tracing::trace!(
            queue = queue,
            outcome = outcome.as_str(),
            duration_secs = duration_secs,
            "Recorded job metric"
        );
    }

    /// Record a failed poll attempt.
    pub fn record_poll_error(&self, queue: &str) {
        if let Some(poll_errors) = POLL_ERRORS_TOTAL.get() {
            poll_errors.with_label_values(&[queue]).inc();
        }
    }

    pub fn job_started(&self) {
        if let Some(gauge) = JOBS_IN_PROGRESS.get() {
            gauge.inc();
        }
    }

    pub fn job_finished(&self) {
        if let Some(gauge) = JOBS_IN_PROGRESS.get() {
            gauge.dec();
        }
    }

    pub fn worker_registered(&self) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.inc();
        }
    }

    pub fn worker_unregistered(&self) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.dec();
        }
    }
}
