//! Resque-compatible worker pool.
//!
//! This module provides everything needed to consume Resque queues:
//!
//! - **Job**: the `{"class", "args"}` payload and the records published about it
//! - **QueueStore**: the key/value store gateway (Redis, or in-memory)
//! - **JobExecutor**: runs each job in its own subprocess
//! - **Worker / QueueRunner**: polling loops, N per queue
//! - **PoolSupervisor**: one runner per queue, signals, single shutdown routine
//!
//! # Architecture
//!
//! ```text
//!                         ┌──────────────────┐
//!                         │  PoolSupervisor  │◄──── SIGINT / SIGTERM / SIGHUP
//!                         └────────┬─────────┘
//!                                  │
//!               ┌──────────────────┼──────────────────┐
//!               ▼                  ▼                  ▼
//!        ┌─────────────┐    ┌─────────────┐    ┌─────────────┐
//!        │ QueueRunner │    │ QueueRunner │    │ QueueRunner │
//!        │   "mail"    │    │  "reports"  │    │     ...     │
//!        └──────┬──────┘    └─────────────┘    └─────────────┘
//!               │
//!        ┌──────┴──────┐
//!        ▼             ▼
//!   ┌─────────┐   ┌─────────┐        LPOP resque:queue:mail
//!   │ Worker 0│   │ Worker 1│ ──────────────────────────────►  Redis
//!   └────┬────┘   └─────────┘
//!        │ spawn
//!        ▼
//!   <scripts>/<class> args...   (exit code + stderr)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use resque_pool::config::PoolConfig;
//! use resque_pool::scheduler::{PoolSupervisor, ShutdownSignals};
//!
//! let config = PoolConfig::from_env()?.resolve_paths()?;
//! let signals = ShutdownSignals::install()?;
//! let supervisor = PoolSupervisor::connect(&config).await?;
//!
//! // Blocks until a signal or a worker panic, then unregisters every worker
//! let reason = supervisor.run_with_signals(signals).await;
//! ```
//!
//! # Delivery Semantics
//!
//! A popped job is never returned to its queue. If the process dies while a
//! job runs, that job is lost; its working-on record remains until the
//! worker identity is cleaned up externally.

pub mod executor;
pub mod inspect;
pub mod job;
pub mod memory;
pub mod queue;
pub mod supervisor;
pub mod worker_pool;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use executor::{ExecutionOutput, ExecutorError, JobExecutor, ScriptExecutor};
pub use job::{Classification, FailureRecord, Job, WorkerIdentity, WorkingOnRecord};
pub use memory::MemoryQueueStore;
pub use queue::{Keys, QueueError, QueueStore, RedisConnector, RedisQueueStore, StoreConnector};
pub use supervisor::{PoolSupervisor, ShutdownReason, ShutdownSignals};
pub use worker_pool::{PoolError, QueueRunner, Worker, WorkerSettings, WorkerState};
