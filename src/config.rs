//! Pool configuration.
//!
//! The configuration is resolved once at startup (environment first, then
//! CLI overrides) and then passed by value into the supervisor. Nothing
//! re-reads the environment afterwards.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::scheduler::queue::DEFAULT_NAMESPACE;

pub const ENV_QUEUES: &str = "RESQUE_QUEUES";
pub const ENV_WORKERS: &str = "RESQUE_WORKERS";
pub const ENV_INTERVAL: &str = "RESQUE_INTERVAL";
pub const ENV_REDIS_URL: &str = "REDIS_URL";
pub const ENV_SCRIPTS: &str = "RESQUE_SCRIPTS";
pub const ENV_NAMESPACE: &str = "RESQUE_NAMESPACE";
pub const ENV_METRICS_FILE: &str = "RESQUE_METRICS_FILE";

const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379/0";
const DEFAULT_SCRIPTS_ROOT: &str = "./scripts";
const DEFAULT_POLL_INTERVAL_SECS: f64 = 5.0;

/// Errors that can occur while resolving the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while resolving paths.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolved configuration of a worker pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Queues to consume, one Queue Runner each.
    pub queues: Vec<String>,
    /// Number of workers started for every queue.
    pub workers_per_queue: usize,
    /// Delay between poll attempts.
    pub poll_interval: Duration,
    /// Redis connection URL.
    pub redis_url: String,
    /// Directory job classes are resolved against.
    pub scripts_root: PathBuf,
    /// Prefix of every key in the store.
    pub namespace: String,
    /// Where to write Prometheus metrics, if anywhere.
    pub metrics_path: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            queues: vec![DEFAULT_QUEUE.to_string()],
            workers_per_queue: 1,
            poll_interval: Duration::from_secs_f64(DEFAULT_POLL_INTERVAL_SECS),
            redis_url: DEFAULT_REDIS_URL.to_string(),
            scripts_root: PathBuf::from(DEFAULT_SCRIPTS_ROOT),
            namespace: DEFAULT_NAMESPACE.to_string(),
            metrics_path: None,
        }
    }
}

impl PoolConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `RESQUE_QUEUES`: Comma-separated queue names (default: default)
    /// - `RESQUE_WORKERS`: Workers per queue (default: 1)
    /// - `RESQUE_INTERVAL`: Poll interval in seconds, fractional allowed (default: 5.0)
    /// - `REDIS_URL`: Redis connection URL (default: redis://localhost:6379/0)
    /// - `RESQUE_SCRIPTS`: Scripts root (default: ./scripts)
    /// - `RESQUE_NAMESPACE`: Key namespace (default: resque)
    /// - `RESQUE_METRICS_FILE`: Prometheus textfile path (default: unset)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Creates configuration from an arbitrary key lookup.
    ///
    /// Unset and empty values fall back to defaults. The result is not
    /// validated; call [`PoolConfig::validate`] once overrides are applied.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(val) = get(ENV_QUEUES) {
            config.queues = parse_queue_list(&val);
        }

        if let Some(val) = get(ENV_WORKERS) {
            config.workers_per_queue = parse_env_value(val.trim(), ENV_WORKERS)?;
        }

        if let Some(val) = get(ENV_INTERVAL) {
            let secs: f64 = parse_env_value(val.trim(), ENV_INTERVAL)?;
            config.poll_interval = interval_from_secs(secs, ENV_INTERVAL)?;
        }

        if let Some(val) = get(ENV_REDIS_URL) {
            config.redis_url = val;
        }

        if let Some(val) = get(ENV_SCRIPTS) {
            config.scripts_root = PathBuf::from(val);
        }

        if let Some(val) = get(ENV_NAMESPACE) {
            config.namespace = val;
        }

        if let Some(val) = get(ENV_METRICS_FILE) {
            config.metrics_path = Some(PathBuf::from(val));
        }

        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queues.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one queue is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for queue in &self.queues {
            if queue.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "queue names cannot be empty".to_string(),
                ));
            }
            if !seen.insert(queue.as_str()) {
                return Err(ConfigError::ValidationFailed(format!(
                    "queue '{}' is listed more than once",
                    queue
                )));
            }
        }

        if self.workers_per_queue == 0 {
            return Err(ConfigError::ValidationFailed(
                "workers_per_queue must be greater than 0".to_string(),
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.redis_url.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.namespace.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "namespace cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Makes `scripts_root` absolute against the current directory.
    pub fn resolve_paths(mut self) -> Result<Self, ConfigError> {
        let cwd = std::env::current_dir()?;
        self.scripts_root = absolute_from(&cwd, &self.scripts_root);
        Ok(self)
    }

    /// Builder method to set the queues.
    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    /// Builder method to set the number of workers per queue.
    pub fn with_workers_per_queue(mut self, workers: usize) -> Self {
        self.workers_per_queue = workers;
        self
    }

    /// Builder method to set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to set the scripts root.
    pub fn with_scripts_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.scripts_root = path.into();
        self
    }

    /// Builder method to set the key namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Builder method to set the metrics textfile path.
    pub fn with_metrics_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.metrics_path = Some(path.into());
        self
    }
}

/// Splits a comma-separated queue list, trimming names and dropping empties.
pub fn parse_queue_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Converts a number of seconds into a poll interval.
pub fn interval_from_secs(secs: f64, key: &str) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{}' is not a valid number of seconds", secs),
    })
}

fn absolute_from(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path.strip_prefix(".").unwrap_or(path))
    }
}

/// Parse an environment variable value.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
