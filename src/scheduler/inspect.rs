//! Producer and read-only views over the queue store.
//!
//! These back the `enqueue`, `stats` and `failures` CLI commands and never
//! touch a running pool's state.

use serde::Serialize;
use tracing::{debug, warn};

use super::job::{FailureRecord, Job, WorkerIdentity, WorkingOnRecord};
use super::queue::{Keys, QueueError, QueueStore, Stat};

/// Pushes a job onto the tail of `queue` and records the queue name.
pub async fn enqueue(
    store: &dyn QueueStore,
    keys: &Keys,
    queue: &str,
    job: &Job,
) -> Result<(), QueueError> {
    let payload = job.to_payload()?;
    store.set_add(&keys.queues(), queue).await?;
    store.push_tail(&keys.queue(queue), &payload).await?;

    debug!(queue = %queue, class = %job.target, "Enqueued job");
    Ok(())
}

/// A registered worker as seen through the store.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub identity: String,
    pub started: Option<String>,
    pub working_on: Option<WorkingOnRecord>,
}

/// Pending jobs on one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub queue: String,
    pub pending: usize,
}

/// Point-in-time view of a namespace.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub processed: i64,
    pub failed: i64,
    pub failures_recorded: usize,
    pub queues: Vec<QueueDepth>,
    pub workers: Vec<WorkerSnapshot>,
}

impl StoreStats {
    /// Total jobs waiting across all queues.
    pub fn pending(&self) -> usize {
        self.queues.iter().map(|q| q.pending).sum()
    }

    /// Workers currently holding a job.
    pub fn busy_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.working_on.is_some()).count()
    }
}

/// Gathers counters, queue depths and registered workers.
///
/// Queues are the union of the `queues` set and the queues of registered
/// workers, so queues fed by producers that never register them still show up.
pub async fn stats(store: &dyn QueueStore, keys: &Keys) -> Result<StoreStats, QueueError> {
    let processed = read_counter(store, &keys.stat(Stat::Processed)).await?;
    let failed = read_counter(store, &keys.stat(Stat::Failed)).await?;
    let failures_recorded = store.list_len(&keys.failed()).await?;

    let identities = store.set_members(&keys.workers()).await?;
    let mut queue_names = store.set_members(&keys.queues()).await?;

    let mut workers = Vec::with_capacity(identities.len());
    for identity in identities {
        if let Ok(parsed) = identity.parse::<WorkerIdentity>() {
            queue_names.push(parsed.queue);
        }

        let started = store.get(&keys.worker_started(&identity)).await?;
        let working_on = match store.get(&keys.worker(&identity)).await? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(worker = %identity, error = %e, "Unreadable working-on record");
                    None
                }
            },
            None => None,
        };

        workers.push(WorkerSnapshot {
            identity,
            started,
            working_on,
        });
    }

    queue_names.sort();
    queue_names.dedup();

    let mut queues = Vec::with_capacity(queue_names.len());
    for queue in queue_names {
        let pending = store.list_len(&keys.queue(&queue)).await?;
        queues.push(QueueDepth { queue, pending });
    }

    Ok(StoreStats {
        processed,
        failed,
        failures_recorded,
        queues,
        workers,
    })
}

/// Returns up to `limit` failure records, newest first.
///
/// Entries that do not parse as failure records are skipped with a warning.
pub async fn recent_failures(
    store: &dyn QueueStore,
    keys: &Keys,
    limit: usize,
) -> Result<Vec<FailureRecord>, QueueError> {
    let entries = store.list_range(&keys.failed(), limit).await?;

    Ok(entries
        .iter()
        .filter_map(|entry| match serde_json::from_str(entry) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, "Skipping unreadable failure record");
                None
            }
        })
        .collect())
}

async fn read_counter(store: &dyn QueueStore, key: &str) -> Result<i64, QueueError> {
    Ok(store
        .get(key)
        .await?
        .and_then(|value| value.parse().ok())
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::Classification;
    use crate::scheduler::memory::MemoryQueueStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_enqueue_appends_and_registers_queue() {
        let store = MemoryQueueStore::new();
        let keys = Keys::default();

        enqueue(&store, &keys, "mail", &Job::new("First", vec![json!(1)]))
            .await
            .expect("enqueue");
        enqueue(&store, &keys, "mail", &Job::new("Second", vec![]))
            .await
            .expect("enqueue");

        assert_eq!(
            store.set_members(&keys.queues()).await.expect("members"),
            vec!["mail".to_string()]
        );
        let head = store
            .pop_head(&keys.queue("mail"))
            .await
            .expect("pop")
            .expect("entry");
        assert_eq!(Job::from_payload(&head).expect("job").target, "First");
    }

    #[tokio::test]
    async fn test_stats_on_empty_namespace() {
        let store = MemoryQueueStore::new();
        let stats = stats(&store, &Keys::default()).await.expect("stats");

        assert_eq!(stats.processed, 0);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.failures_recorded, 0);
        assert!(stats.queues.is_empty());
        assert!(stats.workers.is_empty());
    }

    #[tokio::test]
    async fn test_stats_reports_workers_and_queues() {
        let store = MemoryQueueStore::new();
        let keys = Keys::default();
        let id = WorkerIdentity::new("box", 9, 0, "unlisted").to_string();

        enqueue(&store, &keys, "mail", &Job::new("A", vec![]))
            .await
            .expect("enqueue");
        store.incr(&keys.stat(Stat::Processed)).await.expect("incr");
        store.incr(&keys.stat(Stat::Processed)).await.expect("incr");
        store.incr(&keys.stat(Stat::Failed)).await.expect("incr");
        store.set_add(&keys.workers(), &id).await.expect("sadd");
        store
            .set(&keys.worker_started(&id), "2024-01-01T00:00:00+00:00")
            .await
            .expect("set");
        let record = WorkingOnRecord::new("unlisted", Job::new("Busy", vec![]));
        store
            .set(&keys.worker(&id), &serde_json::to_string(&record).expect("json"))
            .await
            .expect("set");

        let stats = stats(&store, &keys).await.expect("stats");

        assert_eq!(stats.processed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(
            stats.queues,
            vec![
                QueueDepth {
                    queue: "mail".to_string(),
                    pending: 1
                },
                QueueDepth {
                    queue: "unlisted".to_string(),
                    pending: 0
                },
            ]
        );
        assert_eq!(stats.pending(), 1);
        assert_eq!(stats.workers.len(), 1);
        assert_eq!(stats.busy_workers(), 1);
        assert_eq!(
            stats.workers[0].started.as_deref(),
            Some("2024-01-01T00:00:00+00:00")
        );
        assert_eq!(
            stats.workers[0]
                .working_on
                .as_ref()
                .map(|w| w.payload.target.as_str()),
            Some("Busy")
        );
    }

    #[tokio::test]
    async fn test_recent_failures_newest_first_and_limited() {
        let store = MemoryQueueStore::new();
        let keys = Keys::default();
        let worker = WorkerIdentity::new("box", 1, 0, "mail");

        for name in ["Old", "Middle", "New"] {
            let record = FailureRecord::new(
                Job::new(name, vec![]),
                &worker,
                Classification::named("E", name),
            );
            store
                .push_head(&keys.failed(), &serde_json::to_string(&record).expect("json"))
                .await
                .expect("push");
        }
        store.push_head(&keys.failed(), "garbage").await.expect("push");

        let records = recent_failures(&store, &keys, 3).await.expect("failures");
        let targets: Vec<&str> = records.iter().map(|r| r.payload.target.as_str()).collect();
        assert_eq!(targets, vec!["New", "Middle"]);

        let all = recent_failures(&store, &keys, 10).await.expect("failures");
        assert_eq!(all.len(), 3);
    }
}
