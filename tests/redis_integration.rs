//! Integration tests against a real Redis server.
//!
//! Each test uses its own key namespace and deletes nothing outside it.
//! Run with: REDIS_URL=redis://localhost:6379/0 cargo test --test redis_integration -- --ignored

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use resque_pool::config::PoolConfig;
use resque_pool::scheduler::inspect;
use resque_pool::scheduler::queue::Stat;
use resque_pool::scheduler::{
    Job, Keys, PoolSupervisor, QueueStore, RedisConnector, RedisQueueStore, ScriptExecutor,
    ShutdownReason,
};
use serde_json::json;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379/0".to_string())
}

fn unique_namespace(name: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    format!("resque-pool-test:{}:{}:{}", name, std::process::id(), nanos)
}

async fn connect() -> RedisQueueStore {
    RedisQueueStore::connect(&redis_url())
        .await
        .expect("Redis must be reachable at REDIS_URL for integration tests")
}

async fn cleanup(store: &RedisQueueStore, keys: &Keys, queues: &[&str]) {
    let mut all = vec![
        keys.queues(),
        keys.workers(),
        keys.failed(),
        keys.stat(Stat::Processed),
        keys.stat(Stat::Failed),
    ];
    all.extend(queues.iter().map(|q| keys.queue(q)));
    store.delete(&all).await.expect("cleanup");
}

#[cfg(unix)]
fn write_script(root: &std::path::Path, name: &str, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    let path = root.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
    let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod");
}

async fn wait_for_counter(store: &RedisQueueStore, key: &str, expected: i64) {
    for _ in 0..100 {
        let value = store.get(key).await.expect("get");
        if value.and_then(|v| v.parse::<i64>().ok()) == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("{} never reached {}", key, expected);
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_store_operations() {
    let store = connect().await;
    let keys = Keys::new(unique_namespace("ops"));
    let list = keys.queue("ops");

    store.push_tail(&list, "a").await.expect("rpush");
    store.push_tail(&list, "b").await.expect("rpush");
    assert_eq!(store.list_len(&list).await.expect("llen"), 2);
    assert_eq!(store.pop_head(&list).await.expect("lpop"), Some("a".to_string()));
    assert_eq!(store.pop_head(&list).await.expect("lpop"), Some("b".to_string()));
    assert_eq!(store.pop_head(&list).await.expect("lpop"), None);

    assert_eq!(store.incr(&keys.stat(Stat::Processed)).await.expect("incr"), 1);
    assert_eq!(store.incr(&keys.stat(Stat::Processed)).await.expect("incr"), 2);

    store.set_add(&keys.workers(), "w").await.expect("sadd");
    assert_eq!(
        store.set_members(&keys.workers()).await.expect("smembers"),
        vec!["w".to_string()]
    );
    store.set_remove(&keys.workers(), "w").await.expect("srem");

    cleanup(&store, &keys, &["ops"]).await;
}

#[cfg(unix)]
#[tokio::test]
#[ignore]
async fn test_pool_processes_and_fails_jobs() {
    let store = connect().await;
    let namespace = unique_namespace("pool");
    let keys = Keys::new(namespace.clone());
    let scripts = tempfile::tempdir().expect("tempdir");

    write_script(scripts.path(), "Ok", "exit 0");
    write_script(
        scripts.path(),
        "Boom",
        r#"echo "working" >&2; echo '{"exception":"Boom","error":"bad input","backtrace":["Boom:1"]}' >&2; exit 1"#,
    );

    inspect::enqueue(&store, &keys, "it", &Job::new("Ok", vec![json!(1)]))
        .await
        .expect("enqueue");
    inspect::enqueue(&store, &keys, "it", &Job::new("Boom", vec![json!("x")]))
        .await
        .expect("enqueue");

    let config = PoolConfig::default()
        .with_queues(["it"])
        .with_workers_per_queue(2)
        .with_poll_interval(Duration::from_millis(100))
        .with_redis_url(redis_url())
        .with_namespace(namespace)
        .with_scripts_root(scripts.path());

    let supervisor = PoolSupervisor::start(
        &config,
        Arc::new(RedisConnector::new(redis_url())),
        Arc::new(ScriptExecutor::new(scripts.path())),
    )
    .await
    .expect("pool should start");

    let stats = inspect::stats(&store, &keys).await.expect("stats");
    assert_eq!(stats.workers.len(), 2);

    let watcher = connect().await;
    let processed_key = keys.stat(Stat::Processed);
    let failed_key = keys.stat(Stat::Failed);
    let reason = supervisor
        .run_until(async move {
            wait_for_counter(&watcher, &processed_key, 1).await;
            wait_for_counter(&watcher, &failed_key, 1).await;
            "SIGTERM"
        })
        .await;
    assert_eq!(reason, ShutdownReason::Signal("SIGTERM"));

    let stats = inspect::stats(&store, &keys).await.expect("stats");
    assert!(stats.workers.is_empty(), "workers should be unregistered");
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.failed, 1);

    let failures = inspect::recent_failures(&store, &keys, 10)
        .await
        .expect("failures");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].exception, json!("Boom"));
    assert_eq!(failures[0].error, json!("bad input"));
    assert_eq!(failures[0].backtrace, json!(["Boom:1"]));
    assert_eq!(failures[0].payload.args, vec![json!("x")]);
    assert_eq!(failures[0].queue, "it");

    cleanup(&store, &keys, &["it"]).await;
}
