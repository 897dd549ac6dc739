//! In-process queue store.
//!
//! `MemoryQueueStore` keeps lists, sets, strings and counters behind a single
//! mutex, so every operation is atomic in the same way Redis commands are.
//! Clones share the same data; connecting through it as a `StoreConnector`
//! hands out another clone.
//!
//! Transport failures can be injected with [`MemoryQueueStore::fail_next_pops`]
//! to exercise the worker's retry path.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::queue::{QueueError, QueueStore, StoreConnector};

#[derive(Debug, Default)]
struct Data {
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, BTreeSet<String>>,
    strings: HashMap<String, String>,
    counters: HashMap<String, i64>,
}

#[derive(Debug, Default)]
struct Shared {
    data: Mutex<Data>,
    failing_pops: AtomicUsize,
    pop_attempts: AtomicUsize,
    connections: AtomicUsize,
}

/// Queue store held entirely in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueueStore {
    shared: Arc<Shared>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls to `pop_head` fail with a transport error.
    pub fn fail_next_pops(&self, count: usize) {
        self.shared.failing_pops.store(count, Ordering::SeqCst);
    }

    /// Number of `pop_head` calls made so far, including failed ones.
    pub fn pop_attempts(&self) -> usize {
        self.shared.pop_attempts.load(Ordering::SeqCst)
    }

    /// Number of connections opened through the `StoreConnector` impl.
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Current value of a counter (0 if never incremented).
    pub fn counter(&self, key: &str) -> i64 {
        self.lock().counters.get(key).copied().unwrap_or(0)
    }

    /// Whether any value is stored under `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        let data = self.lock();
        data.lists.contains_key(key)
            || data.sets.contains_key(key)
            || data.strings.contains_key(key)
            || data.counters.contains_key(key)
    }

    fn lock(&self) -> MutexGuard<'_, Data> {
        // A poisoned lock only means a test panicked while holding it.
        self.shared
            .data
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn pop_head(&self, key: &str) -> Result<Option<String>, QueueError> {
        self.shared.pop_attempts.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .shared
            .failing_pops
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(QueueError::Unavailable("injected pop failure".to_string()));
        }

        let mut data = self.lock();
        let value = data.lists.get_mut(key).and_then(VecDeque::pop_front);
        if data.lists.get(key).is_some_and(VecDeque::is_empty) {
            data.lists.remove(key);
        }
        Ok(value)
    }

    async fn push_head(&self, key: &str, value: &str) -> Result<(), QueueError> {
        self.lock()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        Ok(())
    }

    async fn push_tail(&self, key: &str, value: &str) -> Result<(), QueueError> {
        self.lock()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn list_range(&self, key: &str, count: usize) -> Result<Vec<String>, QueueError> {
        Ok(self
            .lock()
            .lists
            .get(key)
            .map(|list| list.iter().take(count).cloned().collect())
            .unwrap_or_default())
    }

    async fn list_len(&self, key: &str) -> Result<usize, QueueError> {
        Ok(self.lock().lists.get(key).map_or(0, VecDeque::len))
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), QueueError> {
        self.lock()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), QueueError> {
        let mut data = self.lock();
        if let Some(set) = data.sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                data.sets.remove(key);
            }
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, QueueError> {
        Ok(self
            .lock()
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), QueueError> {
        self.lock()
            .strings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, QueueError> {
        let data = self.lock();
        Ok(data
            .strings
            .get(key)
            .cloned()
            .or_else(|| data.counters.get(key).map(i64::to_string)))
    }

    async fn delete(&self, keys: &[String]) -> Result<(), QueueError> {
        let mut data = self.lock();
        for key in keys {
            data.lists.remove(key);
            data.sets.remove(key);
            data.strings.remove(key);
            data.counters.remove(key);
        }
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, QueueError> {
        let mut data = self.lock();
        let counter = data.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }
}

#[async_trait]
impl StoreConnector for MemoryQueueStore {
    async fn connect(&self) -> Result<Box<dyn QueueStore>, QueueError> {
        self.shared.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.clone()))
    }
}
