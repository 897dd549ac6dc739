//! Prometheus metrics for the worker pool.
//!
//! The authoritative job statistics live in the queue store (`stat:processed`
//! and `stat:failed`). These in-process metrics add per-queue detail and
//! timing for this process only, and are exported in the Prometheus text
//! format, optionally to a textfile-collector file.
//!
//! # Example
//!
//! ```ignore
//! use resque_pool::metrics::{export_metrics, init_metrics, JobOutcome, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_job("mail", JobOutcome::Succeeded, 1.5);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{JobOutcome, MetricsCollector};
pub use prometheus::{export_metrics, init_metrics, write_textfile};

pub use prometheus::{
    ACTIVE_WORKERS, JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION, POLL_ERRORS_TOTAL, REGISTRY,
};
