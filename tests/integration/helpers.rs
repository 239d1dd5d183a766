//! Shared test helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::Map;

use taskhub_broker::StoreBroker;
use taskhub_broker::memory::MemoryQueueStore;
use taskhub_core::config::{BrokerConfig, WorkerConfig};
use taskhub_core::traits::Broker;
use taskhub_core::types::{Job, JobReport};
use taskhub_worker::Worker;

/// In-memory broker type used throughout the tests
pub type MemoryBroker = StoreBroker<MemoryQueueStore>;

/// Broker settings with the given visibility timeout
pub fn broker_config(unacked_ttl_seconds: u64) -> BrokerConfig {
    BrokerConfig {
        provider: "memory".to_string(),
        unacked_ttl_seconds,
        ..BrokerConfig::default()
    }
}

/// A started broker over `store`
pub async fn started_broker(store: &MemoryQueueStore, unacked_ttl_seconds: u64) -> Arc<MemoryBroker> {
    let broker = StoreBroker::new(store.clone(), broker_config(unacked_ttl_seconds));
    broker.start().await.expect("broker should start");
    Arc::new(broker)
}

/// Worker settings tuned for fast tests
pub fn worker_config(concurrency: usize, queues: &[&str]) -> WorkerConfig {
    WorkerConfig {
        name: "test-worker".to_string(),
        concurrency,
        poll_rate_ms: 10,
        queues: queues.iter().map(|q| q.to_string()).collect(),
        shutdown_grace_seconds: 5,
        report_history: 100,
    }
}

/// A job without arguments
pub fn job(id: &str, name: &str, queue: &str) -> Job {
    Job::with_id(id, name, queue, vec![], Map::new())
}

/// Poll `check` every 10ms until it holds or `limit` elapses
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Wait until `worker` holds a terminal report for every id in `ids`
pub async fn wait_for_reports(worker: &Worker, ids: &[&str]) -> Vec<JobReport> {
    let done = wait_until(Duration::from_secs(30), || {
        ids.iter().all(|id| {
            worker
                .report(id)
                .map(|r| r.status.is_terminal())
                .unwrap_or(false)
        })
    })
    .await;
    assert!(done, "jobs {ids:?} did not finish");
    ids.iter().filter_map(|id| worker.report(id)).collect()
}
