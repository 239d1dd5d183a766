//! Integration tests for at-least-once delivery through the store broker.

mod helpers;

use std::collections::HashSet;

use futures::StreamExt;

use taskhub_broker::memory::MemoryQueueStore;
use taskhub_core::traits::{Broker, QueueStore};

use helpers::{job, started_broker};

fn queues(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[tokio::test]
async fn test_unacked_job_is_redelivered_after_crash() {
    let store = MemoryQueueStore::new();
    let crashed = started_broker(&store, 0).await;
    crashed.publish(&job("j1", "noop", "default")).await.unwrap();

    let mut stream = crashed.subscribe(&queues(&["default"])).await.unwrap();
    let leased = stream.next().await.unwrap().unwrap();
    assert_eq!(leased.id, "j1");
    // The consumer dies without acking.
    drop(stream);
    drop(crashed);
    assert_eq!(store.queue_len("default").await.unwrap(), 0);

    let survivor = started_broker(&store, 0).await;
    let report = survivor.sweep_now().await.unwrap();
    assert_eq!(report.redelivered, 1);

    let mut stream = survivor.subscribe(&queues(&["default"])).await.unwrap();
    let redelivered = stream.next().await.unwrap().unwrap();
    assert_eq!(redelivered, leased);

    survivor.ack("j1").await.unwrap();
    assert_eq!(store.unacked_len().await.unwrap(), 0);
    survivor.close().await.unwrap();
}

#[tokio::test]
async fn test_no_job_is_silently_lost() {
    let store = MemoryQueueStore::new();
    let broker = started_broker(&store, 0).await;

    let mut published = Vec::new();
    for i in 0..20 {
        let queue = if i % 2 == 0 { "even" } else { "odd" };
        let id = format!("j{i}");
        broker.publish(&job(&id, "noop", queue)).await.unwrap();
        published.push(id);
    }

    let mut stream = broker.subscribe(&queues(&["even", "odd"])).await.unwrap();
    let mut acked = HashSet::new();
    for n in 0..12 {
        let fetched = stream.next().await.unwrap().unwrap();
        if n % 3 != 0 {
            broker.ack(&fetched.id).await.unwrap();
            acked.insert(fetched.id);
        }
    }
    drop(stream);
    assert_eq!(acked.len(), 8);
    assert_eq!(store.unacked_len().await.unwrap(), 12);

    broker.sweep_now().await.unwrap();

    // Everything not acked must be fetchable again, duplicates allowed.
    let waiting = store.queue_len("even").await.unwrap() + store.queue_len("odd").await.unwrap();
    let mut stream = broker.subscribe(&queues(&["even", "odd"])).await.unwrap();
    let mut seen = HashSet::new();
    for _ in 0..waiting {
        let fetched = stream.next().await.unwrap().unwrap();
        seen.insert(fetched.id);
    }

    let expected: HashSet<String> = published
        .into_iter()
        .filter(|id| !acked.contains(id))
        .collect();
    assert_eq!(seen, expected);
    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_round_robin_across_queues() {
    let store = MemoryQueueStore::new();
    let broker = started_broker(&store, 1800).await;
    for queue in ["a", "b", "c"] {
        for n in 0..3 {
            broker
                .publish(&job(&format!("{queue}{n}"), "noop", queue))
                .await
                .unwrap();
        }
    }

    let mut stream = broker.subscribe(&queues(&["a", "b", "c"])).await.unwrap();
    let mut order = Vec::new();
    for _ in 0..9 {
        order.push(stream.next().await.unwrap().unwrap().id);
    }

    assert_eq!(
        order,
        vec!["b0", "c0", "a0", "b1", "c1", "a1", "b2", "c2", "a2"]
    );
    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_empty_queue_does_not_block_others() {
    let store = MemoryQueueStore::new();
    let broker = started_broker(&store, 1800).await;
    broker.publish(&job("c1", "noop", "c")).await.unwrap();

    let mut stream = broker.subscribe(&queues(&["a", "b", "c"])).await.unwrap();
    let fetched = stream.next().await.unwrap().unwrap();
    assert_eq!(fetched.queue, "c");
    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_ack_before_sweep_prevents_redelivery() {
    let store = MemoryQueueStore::new();
    let broker = started_broker(&store, 0).await;
    broker.publish(&job("j1", "noop", "default")).await.unwrap();

    let mut stream = broker.subscribe(&queues(&["default"])).await.unwrap();
    stream.next().await.unwrap().unwrap();
    broker.ack("j1").await.unwrap();

    let report = broker.sweep_now().await.unwrap();
    assert_eq!(report.redelivered, 0);
    assert_eq!(store.queue_len("default").await.unwrap(), 0);
    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_only_one_sweeper_at_a_time() {
    let store = MemoryQueueStore::new();
    let first = started_broker(&store, 0).await;
    let second = started_broker(&store, 0).await;
    first.publish(&job("j1", "noop", "default")).await.unwrap();

    store
        .try_lock("sweep", "someone-else", std::time::Duration::from_secs(60))
        .await
        .unwrap();
    assert!(first.sweep_now().await.unwrap().skipped);
    assert!(second.sweep_now().await.unwrap().skipped);
    assert_eq!(store.queue_len("default").await.unwrap(), 1);

    store.unlock("sweep", "someone-else").await.unwrap();
    let report = second.sweep_now().await.unwrap();
    assert!(!report.skipped);
    assert_eq!(report.redelivered, 1);

    first.close().await.unwrap();
    second.close().await.unwrap();
}

#[tokio::test]
async fn test_publish_fails_while_store_is_down() {
    let store = MemoryQueueStore::new();
    let broker = started_broker(&store, 1800).await;

    store.set_offline(true);
    let err = broker.publish(&job("j1", "noop", "default")).await.unwrap_err();
    assert!(err.is_connection());

    store.set_offline(false);
    broker.publish(&job("j1", "noop", "default")).await.unwrap();
    broker.close().await.unwrap();
}
