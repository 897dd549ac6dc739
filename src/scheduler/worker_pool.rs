//! Workers and the queue runners that own them.
//!
//! A `Worker` owns one polling loop against one queue. Its lifecycle is:
//!
//! ```text
//! Stopped → Registering → Polling → Claimed → Executing → Polling → … → Unregistering → Stopped
//! ```
//!
//! Each loop iteration pops at most one job, runs it through the
//! `JobExecutor`, records the outcome, and then waits one poll interval
//! before the next attempt. The wait is cancellable; stopping a worker
//! cancels it, while a job that is already executing is left to finish and
//! record its outcome.
//!
//! A `QueueRunner` starts a fixed number of workers for one queue and stops
//! them together.
//!
//! # Failure Handling
//!
//! - Transport errors while polling are logged and retried after the interval
//! - Malformed queue entries are logged and dropped; no failure record can be
//!   attributed to them
//! - Errors while recording an outcome are logged and never stop the loop
//! - A panic inside the loop cancels the pool's fatal token

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConfigError;
use crate::metrics::{JobOutcome, MetricsCollector};

use super::executor::JobExecutor;
use super::job::{local_hostname, Classification, FailureRecord, Job, WorkerIdentity, WorkingOnRecord};
use super::queue::{Keys, QueueError, QueueStore, Stat, StoreConnector};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A queue store operation failed.
    #[error("Queue store error: {0}")]
    Store(#[from] QueueError),

    /// The worker was started twice.
    #[error("Worker {0} is already running")]
    AlreadyRunning(String),

    /// The pool configuration is invalid.
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Where a worker is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Registering,
    Polling,
    Claimed,
    Executing,
    Unregistering,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerState::Stopped => "stopped",
            WorkerState::Registering => "registering",
            WorkerState::Polling => "polling",
            WorkerState::Claimed => "claimed",
            WorkerState::Executing => "executing",
            WorkerState::Unregistering => "unregistering",
        };
        f.write_str(name)
    }
}

/// Dependencies and settings shared by every worker of a pool.
#[derive(Clone)]
pub struct WorkerSettings {
    /// Opens each worker's store connection.
    pub connector: Arc<dyn StoreConnector>,
    /// Runs claimed jobs.
    pub executor: Arc<dyn JobExecutor>,
    /// Store key namespace.
    pub keys: Keys,
    /// Delay between poll attempts.
    pub poll_interval: Duration,
    /// Host part of worker identities.
    pub host: String,
    /// Process id part of worker identities.
    pub process_id: u32,
    /// Cancelled when a worker loop dies unexpectedly.
    pub fatal: CancellationToken,
}

impl WorkerSettings {
    pub fn new(
        connector: Arc<dyn StoreConnector>,
        executor: Arc<dyn JobExecutor>,
        keys: Keys,
        poll_interval: Duration,
    ) -> Self {
        Self {
            connector,
            executor,
            keys,
            poll_interval,
            host: local_hostname(),
            process_id: std::process::id(),
            fatal: CancellationToken::new(),
        }
    }

    /// Sets the token cancelled when a worker loop panics.
    pub fn with_fatal_token(mut self, token: CancellationToken) -> Self {
        self.fatal = token;
        self
    }

    /// Sets the host used in worker identities.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Identity of the worker at `index` on `queue`.
    pub fn identity(&self, index: usize, queue: &str) -> WorkerIdentity {
        WorkerIdentity::new(self.host.clone(), self.process_id, index, queue)
    }
}

/// State held while a worker is started.
struct Session {
    store: Arc<dyn QueueStore>,
    running: Arc<AtomicBool>,
    timer: CancellationToken,
    _handle: JoinHandle<()>,
}

/// A single worker polling one queue.
pub struct Worker {
    identity: WorkerIdentity,
    settings: WorkerSettings,
    state: Arc<watch::Sender<WorkerState>>,
    metrics: MetricsCollector,
    session: Option<Session>,
}

impl Worker {
    pub fn new(identity: WorkerIdentity, settings: WorkerSettings) -> Self {
        let (state, _) = watch::channel(WorkerState::Stopped);
        Self {
            identity,
            settings,
            state: Arc::new(state),
            metrics: MetricsCollector::new(),
            session: None,
        }
    }

    /// Returns the worker's identity.
    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    /// Returns the worker's current lifecycle state.
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Subscribes to lifecycle state changes.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Returns whether the worker has been started and not stopped.
    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    /// Connects to the store, registers the worker and starts polling.
    ///
    /// The first poll is issued immediately.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the worker is started, or
    /// `PoolError::Store` if connecting or registering fails. A failed start
    /// leaves nothing registered.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.session.is_some() {
            return Err(PoolError::AlreadyRunning(self.identity.to_string()));
        }

        self.state.send_replace(WorkerState::Registering);

        let store: Arc<dyn QueueStore> = match self.settings.connector.connect().await {
            Ok(store) => Arc::from(store),
            Err(e) => {
                self.state.send_replace(WorkerState::Stopped);
                return Err(e.into());
            }
        };

        if let Err(e) = self.register(store.as_ref()).await {
            if let Err(cleanup) = self.unregister(store.as_ref()).await {
                warn!(worker = %self.identity, error = %cleanup, "Failed to clean up partial registration");
            }
            self.state.send_replace(WorkerState::Stopped);
            return Err(e.into());
        }

        let running = Arc::new(AtomicBool::new(true));
        let timer = CancellationToken::new();

        let poller = Poller {
            id: self.identity.to_string(),
            identity: self.identity.clone(),
            store: Arc::clone(&store),
            executor: Arc::clone(&self.settings.executor),
            keys: self.settings.keys.clone(),
            poll_interval: self.settings.poll_interval,
            running: Arc::clone(&running),
            timer: timer.clone(),
            state: Arc::clone(&self.state),
            metrics: self.metrics,
        };

        self.state.send_replace(WorkerState::Polling);
        self.metrics.worker_registered();

        let identity = self.identity.clone();
        let fatal = self.settings.fatal.clone();
        let handle = tokio::spawn(async move {
            if let Err(panic) = AssertUnwindSafe(poller.run()).catch_unwind().await {
                error!(
                    worker = %identity,
                    panic = %panic_message(panic.as_ref()),
                    "Worker loop panicked, shutting down pool"
                );
                fatal.cancel();
            }
        });

        self.session = Some(Session {
            store,
            running,
            timer,
            _handle: handle,
        });

        info!(worker = %self.identity, "Worker started");
        Ok(())
    }

    /// Stops polling, unregisters the worker and closes its connection.
    ///
    /// A pending poll is cancelled. A job already executing is not waited
    /// for; it still records its outcome, but no poll follows it. Stopping
    /// a stopped worker does nothing.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Store` if unregistering fails. The worker is
    /// stopped either way.
    pub async fn stop(&mut self) -> Result<(), PoolError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };

        session.running.store(false, Ordering::SeqCst);
        session.timer.cancel();

        self.state.send_replace(WorkerState::Unregistering);
        let result = self.unregister(session.store.as_ref()).await;
        self.metrics.worker_unregistered();

        // Dropping our handle closes the connection once an in-flight job
        // has recorded its outcome.
        drop(session);
        self.state.send_replace(WorkerState::Stopped);

        match &result {
            Ok(()) => info!(worker = %self.identity, "Worker stopped"),
            Err(e) => error!(worker = %self.identity, error = %e, "Failed to unregister worker"),
        }

        result.map_err(PoolError::from)
    }

    async fn register(&self, store: &dyn QueueStore) -> Result<(), QueueError> {
        let id = self.identity.to_string();
        let keys = &self.settings.keys;

        store.set_add(&keys.workers(), &id).await?;
        store
            .set(&keys.worker_started(&id), &chrono::Utc::now().to_rfc3339())
            .await?;
        Ok(())
    }

    async fn unregister(&self, store: &dyn QueueStore) -> Result<(), QueueError> {
        let id = self.identity.to_string();
        let keys = &self.settings.keys;

        let removed = store.set_remove(&keys.workers(), &id).await;
        let deleted = store
            .delete(&[
                keys.worker(&id),
                keys.worker_started(&id),
                keys.worker_stat(Stat::Processed, &id),
                keys.worker_stat(Stat::Failed, &id),
            ])
            .await;

        removed.and(deleted)
    }
}

/// Result of one claim attempt.
enum Claim {
    Job(Job),
    Empty,
    /// Nothing to execute; the attempt failed before a job could be identified.
    Bail,
}

/// The polling loop of one started worker.
struct Poller {
    id: String,
    identity: WorkerIdentity,
    store: Arc<dyn QueueStore>,
    executor: Arc<dyn JobExecutor>,
    keys: Keys,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
    timer: CancellationToken,
    state: Arc<watch::Sender<WorkerState>>,
    metrics: MetricsCollector,
}

impl Poller {
    async fn run(self) {
        loop {
            if let Claim::Job(job) = self.claim().await {
                self.process(job).await;
            }

            if !self.is_running() {
                break;
            }
            self.set_state(WorkerState::Polling);

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.timer.cancelled() => break,
            }

            if !self.is_running() {
                break;
            }
        }

        debug!(worker = %self.identity, "Worker loop exited");
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Publishes a state change unless the worker has been stopped.
    fn set_state(&self, state: WorkerState) {
        if self.is_running() {
            self.state.send_replace(state);
        }
    }

    async fn claim(&self) -> Claim {
        let queue = &self.identity.queue;

        let payload = match self.store.pop_head(&self.keys.queue(queue)).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!(worker = %self.identity, "No jobs available");
                return Claim::Empty;
            }
            Err(e) => {
                error!(worker = %self.identity, error = %e, "Failed to poll queue");
                self.metrics.record_poll_error(queue);
                return Claim::Bail;
            }
        };

        match Job::from_payload(&payload) {
            Ok(job) => Claim::Job(job),
            Err(e) => {
                error!(
                    worker = %self.identity,
                    error = %e,
                    payload = %payload,
                    "Dropping malformed queue entry"
                );
                self.metrics.record_poll_error(queue);
                Claim::Bail
            }
        }
    }

    async fn process(&self, job: Job) {
        self.set_state(WorkerState::Claimed);
        debug!(worker = %self.identity, class = %job.target, "Claimed job");

        if let Err(e) = self.publish_working_on(&job).await {
            warn!(worker = %self.identity, error = %e, "Failed to publish working-on record");
        }

        self.set_state(WorkerState::Executing);
        self.metrics.job_started();
        let start = Instant::now();
        let result = self.executor.execute(&job).await;
        self.metrics.job_finished();

        let target = job.target.clone();
        let (outcome, recorded) = match result {
            Ok(output) if output.is_success() => {
                info!(
                    worker = %self.identity,
                    class = %target,
                    duration_ms = output.duration.as_millis() as u64,
                    "Job succeeded"
                );
                (JobOutcome::Succeeded, self.success().await)
            }
            Ok(output) => {
                let classification = Classification::from_diagnostics(&output.diagnostics);
                warn!(
                    worker = %self.identity,
                    class = %target,
                    exit_code = ?output.exit_code,
                    exception = %classification.exception,
                    "Job failed"
                );
                (JobOutcome::Failed, self.fail(job, classification).await)
            }
            Err(e) => {
                warn!(
                    worker = %self.identity,
                    class = %target,
                    error = %e,
                    "Job could not be executed"
                );
                let classification = Classification::named(e.exception_name(), e.to_string());
                (JobOutcome::Failed, self.fail(job, classification).await)
            }
        };

        self.metrics
            .record_job(&self.identity.queue, outcome, start.elapsed().as_secs_f64());

        if let Err(e) = recorded {
            error!(
                worker = %self.identity,
                class = %target,
                outcome = outcome.as_str(),
                error = %e,
                "Failed to record job outcome"
            );
        }
    }

    async fn publish_working_on(&self, job: &Job) -> Result<(), QueueError> {
        let record = WorkingOnRecord::new(self.identity.queue.clone(), job.clone());
        let serialized = serde_json::to_string(&record)?;
        self.store.set(&self.keys.worker(&self.id), &serialized).await
    }

    async fn success(&self) -> Result<(), QueueError> {
        let counted = self.increment(Stat::Processed).await;
        let cleared = self.clear_working_on().await;
        counted.and(cleared)
    }

    async fn fail(&self, job: Job, classification: Classification) -> Result<(), QueueError> {
        let counted = self.increment(Stat::Failed).await;
        let cleared = self.clear_working_on().await;

        let record = FailureRecord::new(job, &self.identity, classification);
        let pushed = match serde_json::to_string(&record) {
            Ok(serialized) => self.store.push_head(&self.keys.failed(), &serialized).await,
            Err(e) => Err(e.into()),
        };

        counted.and(cleared).and(pushed)
    }

    async fn increment(&self, stat: Stat) -> Result<(), QueueError> {
        self.store.incr(&self.keys.stat(stat)).await?;

        // Per-worker counters were deleted on unregister and must stay gone.
        if self.is_running() {
            self.store.incr(&self.keys.worker_stat(stat, &self.id)).await?;
        }
        Ok(())
    }

    async fn clear_working_on(&self) -> Result<(), QueueError> {
        self.store.delete(&[self.keys.worker(&self.id)]).await
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A fixed-size group of workers consuming one queue.
pub struct QueueRunner {
    queue: String,
    workers: Vec<Worker>,
    quit: bool,
}

impl QueueRunner {
    /// Starts `worker_count` workers on `queue`.
    ///
    /// # Errors
    ///
    /// If any worker fails to start, the ones already started are stopped
    /// and the error is returned.
    pub async fn start(
        queue: impl Into<String>,
        worker_count: usize,
        settings: &WorkerSettings,
    ) -> Result<Self, PoolError> {
        let queue = queue.into();
        let mut runner = Self {
            queue: queue.clone(),
            workers: Vec::with_capacity(worker_count),
            quit: false,
        };

        for index in 0..worker_count {
            let mut worker = Worker::new(settings.identity(index, &queue), settings.clone());
            if let Err(e) = worker.start().await {
                error!(queue = %queue, index = index, error = %e, "Failed to start worker");
                runner.quit().await;
                return Err(e);
            }
            runner.workers.push(worker);
        }

        info!(queue = %queue, workers = worker_count, "Queue runner started");
        Ok(runner)
    }

    /// Stops every worker of this runner.
    ///
    /// Returns once each worker's `stop()` has completed. Calling it again
    /// does nothing.
    pub async fn quit(&mut self) {
        if self.quit {
            return;
        }
        self.quit = true;

        info!(queue = %self.queue, "Stopping queue runner");

        join_all(self.workers.iter_mut().map(|worker| async move {
            // stop() already logs the failure
            let _ = worker.stop().await;
        }))
        .await;

        info!(queue = %self.queue, "Queue runner stopped");
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Returns whether `quit()` has been called.
    pub fn has_quit(&self) -> bool {
        self.quit
    }
}
