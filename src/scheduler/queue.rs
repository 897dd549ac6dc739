//! Queue store gateway.
//!
//! The pool talks to its backing store exclusively through the `QueueStore`
//! trait. The production implementation is Redis; `super::memory` provides an
//! in-process one with the same contract.
//!
//! # Key Namespace
//!
//! All keys live under a namespace (default `resque`):
//!
//! - `{ns}:queue:{queue}`: list of job payloads, popped from the head
//! - `{ns}:queues`: set of known queue names
//! - `{ns}:workers`: set of live worker identities
//! - `{ns}:worker:{identity}`: current working-on record
//! - `{ns}:worker:{identity}:started`: RFC 3339 start timestamp
//! - `{ns}:stat:processed` / `{ns}:stat:failed`: global counters
//! - `{ns}:stat:processed:{identity}` / `{ns}:stat:failed:{identity}`: per-worker counters
//! - `{ns}:failed`: list of failure records, newest at the head
//!
//! # Atomicity
//!
//! Implementations must guarantee that `pop_head` hands a given entry to
//! exactly one caller, and that `incr` and the push operations are atomic.
//! Workers rely on this instead of coordinating among themselves.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;

/// Default key namespace.
pub const DEFAULT_NAMESPACE: &str = "resque";

/// Errors that can occur during queue store operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to the store.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// A store command failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to (de)serialize a stored record.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// The store is unavailable (used by the in-memory store's fault injection).
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Renders the keys of the store namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    namespace: String,
}

impl Default for Keys {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl Keys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn queue(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.namespace, queue)
    }

    pub fn queues(&self) -> String {
        format!("{}:queues", self.namespace)
    }

    pub fn workers(&self) -> String {
        format!("{}:workers", self.namespace)
    }

    pub fn worker(&self, identity: &str) -> String {
        format!("{}:worker:{}", self.namespace, identity)
    }

    pub fn worker_started(&self, identity: &str) -> String {
        format!("{}:worker:{}:started", self.namespace, identity)
    }

    pub fn stat(&self, stat: Stat) -> String {
        format!("{}:stat:{}", self.namespace, stat)
    }

    pub fn worker_stat(&self, stat: Stat, identity: &str) -> String {
        format!("{}:stat:{}:{}", self.namespace, stat, identity)
    }

    pub fn failed(&self) -> String {
        format!("{}:failed", self.namespace)
    }
}

/// The two job outcome counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stat {
    Processed,
    Failed,
}

impl std::fmt::Display for Stat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stat::Processed => write!(f, "processed"),
            Stat::Failed => write!(f, "failed"),
        }
    }
}

/// Operations the pool needs from the queue store.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Atomically removes and returns the head of a list.
    async fn pop_head(&self, key: &str) -> Result<Option<String>, QueueError>;

    /// Pushes a value onto the head of a list.
    async fn push_head(&self, key: &str, value: &str) -> Result<(), QueueError>;

    /// Pushes a value onto the tail of a list.
    async fn push_tail(&self, key: &str, value: &str) -> Result<(), QueueError>;

    /// Returns up to `count` list entries starting at the head.
    async fn list_range(&self, key: &str, count: usize) -> Result<Vec<String>, QueueError>;

    async fn list_len(&self, key: &str) -> Result<usize, QueueError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<(), QueueError>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), QueueError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, QueueError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), QueueError>;

    async fn get(&self, key: &str) -> Result<Option<String>, QueueError>;

    /// Deletes every key in `keys`. Missing keys are ignored.
    async fn delete(&self, keys: &[String]) -> Result<(), QueueError>;

    /// Atomically increments a counter and returns its new value.
    async fn incr(&self, key: &str) -> Result<i64, QueueError>;
}

/// Opens connections to a queue store.
///
/// Each worker holds its own connection for as long as it is started.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn QueueStore>, QueueError>;
}

/// Redis-backed queue store.
pub struct RedisQueueStore {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
}

impl RedisQueueStore {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the URL is invalid or the
    /// server cannot be reached.
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self { redis })
    }

    /// Wraps an existing connection manager.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn pop_head(&self, key: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.lpop(key, None).await?;
        Ok(value)
    }

    async fn push_head(&self, key: &str, value: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn push_tail(&self, key: &str, value: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.rpush::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn list_range(&self, key: &str, count: usize) -> Result<Vec<String>, QueueError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let values: Vec<String> = conn.lrange(key, 0, count as isize - 1).await?;
        Ok(values)
    }

    async fn list_len(&self, key: &str) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(key).await?;
        Ok(len)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.srem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, QueueError> {
        let mut conn = self.redis.clone();
        let mut members: Vec<String> = conn.smembers(key).await?;
        members.sort();
        Ok(members)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), QueueError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(keys).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, QueueError> {
        let mut conn = self.redis.clone();
        let value: i64 = conn.incr(key, 1).await?;
        Ok(value)
    }
}

/// Opens a fresh Redis connection per worker.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    redis_url: String,
}

impl RedisConnector {
    pub fn new(redis_url: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
        }
    }
}

#[async_trait]
impl StoreConnector for RedisConnector {
    async fn connect(&self) -> Result<Box<dyn QueueStore>, QueueError> {
        Ok(Box::new(RedisQueueStore::connect(&self.redis_url).await?))
    }
}
