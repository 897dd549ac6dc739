//! Pool supervisor: one queue runner per configured queue, OS signal wiring,
//! and the single shutdown routine.
//!
//! Every shutdown trigger funnels into `quiesce()`:
//!
//! - SIGINT, SIGTERM or SIGHUP
//! - a worker loop panicking, which cancels the supervisor's fatal token
//! - cancelling `shutdown_token()` from outside
//!
//! `quiesce()` cancels the shutdown token and quits every runner. It runs at
//! most once per supervisor.
//!
//! Signal listeners are installed with `ShutdownSignals::install()` before
//! any worker registers, so a signal arriving during startup is buffered
//! and handled by `run_with_signals` instead of killing the process.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::PoolConfig;
use crate::metrics;

use super::executor::{JobExecutor, ScriptExecutor};
use super::queue::{Keys, RedisConnector, StoreConnector};
use super::worker_pool::{PoolError, QueueRunner, WorkerSettings};

/// Why the pool shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// An OS signal, by name.
    Signal(&'static str),
    /// A worker loop died unexpectedly.
    WorkerPanic,
    /// The shutdown token was cancelled from outside.
    Cancelled,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Signal(name) => write!(f, "received {}", name),
            ShutdownReason::WorkerPanic => write!(f, "worker panicked"),
            ShutdownReason::Cancelled => write!(f, "shutdown requested"),
        }
    }
}

/// Owns every queue runner of the process.
pub struct PoolSupervisor {
    runners: Vec<QueueRunner>,
    shutdown: CancellationToken,
    fatal: CancellationToken,
    metrics_path: Option<PathBuf>,
    metrics_interval: Duration,
    quiesced: bool,
}

impl PoolSupervisor {
    /// Starts a pool against Redis, running jobs from the configured scripts root.
    pub async fn connect(config: &PoolConfig) -> Result<Self, PoolError> {
        let connector = Arc::new(RedisConnector::new(config.redis_url.clone()));
        let executor = Arc::new(ScriptExecutor::new(config.scripts_root.clone()));
        Self::start(config, connector, executor).await
    }

    /// Validates `config` and starts one runner per queue.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Config` for an invalid configuration, or the first
    /// error from starting a runner. Runners already started are quit before
    /// returning.
    pub async fn start(
        config: &PoolConfig,
        connector: Arc<dyn StoreConnector>,
        executor: Arc<dyn JobExecutor>,
    ) -> Result<Self, PoolError> {
        config.validate()?;

        let fatal = CancellationToken::new();
        let settings = WorkerSettings::new(
            connector,
            executor,
            Keys::new(config.namespace.clone()),
            config.poll_interval,
        )
        .with_fatal_token(fatal.clone());

        let mut supervisor = Self {
            runners: Vec::with_capacity(config.queues.len()),
            shutdown: CancellationToken::new(),
            fatal,
            metrics_path: config.metrics_path.clone(),
            metrics_interval: config.poll_interval,
            quiesced: false,
        };

        for queue in &config.queues {
            match QueueRunner::start(queue.clone(), config.workers_per_queue, &settings).await {
                Ok(runner) => supervisor.runners.push(runner),
                Err(e) => {
                    error!(queue = %queue, error = %e, "Failed to start queue runner");
                    supervisor.quiesce().await;
                    return Err(e);
                }
            }
        }

        info!(
            queues = ?config.queues,
            workers_per_queue = config.workers_per_queue,
            namespace = %config.namespace,
            "Pool started"
        );

        Ok(supervisor)
    }

    /// Token cancelled when the pool shuts down.
    ///
    /// Cancelling it from outside shuts the pool down with
    /// `ShutdownReason::Cancelled`.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn runners(&self) -> &[QueueRunner] {
        &self.runners
    }

    /// Installs signal listeners, then blocks until a shutdown trigger fires.
    ///
    /// Signals delivered while the pool was starting are not seen here; use
    /// `run_with_signals` with listeners installed before `start`.
    pub async fn run(self) -> ShutdownReason {
        match ShutdownSignals::install() {
            Ok(signals) => self.run_with_signals(signals).await,
            Err(e) => {
                error!(error = %e, "Failed to install signal handlers");
                self.run_until(std::future::pending()).await
            }
        }
    }

    /// Blocks until one of `signals` arrives, a worker panics or the
    /// shutdown token is cancelled, then quiesces.
    pub async fn run_with_signals(self, mut signals: ShutdownSignals) -> ShutdownReason {
        self.run_until(async move { signals.recv().await }).await
    }

    /// Blocks until `signal` resolves, a worker panics or the shutdown token
    /// is cancelled, then quiesces.
    ///
    /// While running, the metrics textfile (if configured) is rewritten every
    /// poll interval.
    pub async fn run_until<F>(mut self, signal: F) -> ShutdownReason
    where
        F: Future<Output = &'static str>,
    {
        tokio::pin!(signal);

        let mut ticker = self.metrics_path.as_ref().map(|_| {
            let mut ticker = tokio::time::interval(self.metrics_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        let reason = loop {
            tokio::select! {
                name = &mut signal => break ShutdownReason::Signal(name),
                _ = self.fatal.cancelled() => break ShutdownReason::WorkerPanic,
                _ = self.shutdown.cancelled() => break ShutdownReason::Cancelled,
                _ = next_tick(&mut ticker) => self.write_metrics().await,
            }
        };

        info!(reason = %reason, "Shutting down pool");
        self.quiesce().await;
        self.write_metrics().await;
        info!("Pool shut down");

        reason
    }

    /// The single shutdown routine: cancels the shutdown token and quits every
    /// runner. Later calls do nothing.
    pub async fn quiesce(&mut self) {
        if self.quiesced {
            return;
        }
        self.quiesced = true;

        self.shutdown.cancel();
        for runner in &mut self.runners {
            runner.quit().await;
        }
    }

    async fn write_metrics(&self) {
        if let Some(path) = &self.metrics_path {
            if let Err(e) = metrics::write_textfile(path).await {
                warn!(path = %path.display(), error = %e, "Failed to write metrics textfile");
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Listeners for the OS shutdown signals.
///
/// Deliveries are buffered from the moment the listeners are installed.
pub struct ShutdownSignals {
    #[cfg(unix)]
    sigint: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sighup: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    /// Installs handlers for SIGINT, SIGTERM and SIGHUP (Ctrl-C elsewhere).
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if a signal handler cannot be installed.
    pub fn install() -> std::io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            Ok(Self {
                sigint: signal(SignalKind::interrupt())?,
                sigterm: signal(SignalKind::terminate())?,
                sighup: signal(SignalKind::hangup())?,
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// Resolves with the name of the first shutdown signal received.
    pub async fn recv(&mut self) -> &'static str {
        #[cfg(unix)]
        let name = tokio::select! {
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sighup.recv() => "SIGHUP",
        };

        #[cfg(not(unix))]
        let name = match tokio::signal::ctrl_c().await {
            Ok(()) => "CTRL_C",
            Err(e) => {
                error!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending().await
            }
        };

        info!(signal = name, "Shutdown signal");
        name
    }
}
