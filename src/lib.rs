//! resque-pool: a Resque-compatible worker pool.
//!
//! This library polls Redis-backed Resque queues with a fixed number of
//! workers per queue and runs every job in an isolated subprocess, keeping
//! Resque's worker registry, statistics and failure list up to date.

pub mod cli;
pub mod config;
pub mod metrics;
pub mod scheduler;

// Re-export commonly used error types
pub use config::ConfigError;
pub use scheduler::{ExecutorError, PoolError, QueueError};
