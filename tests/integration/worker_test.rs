//! Integration tests for the worker runtime.

mod helpers;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use taskhub_broker::memory::MemoryQueueStore;
use taskhub_core::AppResult;
use taskhub_core::events::WorkerEvent;
use taskhub_core::traits::{Broker, JobStream, QueueStore};
use taskhub_core::types::{Job, JobOutcome, JobStatus};
use taskhub_worker::{JobExecutionError, TaskRegistry, Worker, WorkerState};

use helpers::{MemoryBroker, job, started_broker, wait_for_reports, worker_config};

/// Spawn `worker.run` and return the cancel token and join handle
fn spawn_worker(
    worker: &Arc<Worker>,
) -> (CancellationToken, tokio::task::JoinHandle<taskhub_core::AppResult<()>>) {
    let cancel = CancellationToken::new();
    let running = Arc::clone(worker);
    let token = cancel.clone();
    let handle = tokio::spawn(async move { running.run(token).await });
    (cancel, handle)
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_is_bounded() {
    let store = MemoryQueueStore::new();
    let broker = started_broker(&store, 1800).await;

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut registry = TaskRegistry::new("default");
    {
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        registry.register_fn("slow", "default", move |_job| {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, JobExecutionError>(Value::Null)
            }
        });
    }

    let ids = ["j1", "j2", "j3", "j4", "j5"];
    for id in ids {
        broker.publish(&job(id, "slow", "default")).await.unwrap();
    }

    let worker = Arc::new(Worker::new(
        broker.clone(),
        Arc::new(registry),
        worker_config(2, &["default"]),
    ));
    let (cancel, handle) = spawn_worker(&worker);

    let reports = wait_for_reports(&worker, &ids).await;
    assert!(reports.iter().all(|r| r.status == JobStatus::Successful));
    assert_eq!(peak.load(Ordering::SeqCst), 2);

    cancel.cancel();
    handle.await.unwrap().unwrap();
    assert_eq!(store.unacked_len().await.unwrap(), 0);
    broker.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failing_job_is_acked_and_worker_continues() {
    let store = MemoryQueueStore::new();
    let broker = started_broker(&store, 1800).await;

    let mut registry = TaskRegistry::new("default");
    registry.register_fn("boom", "default", |_job| async move {
        Err::<Value, _>(JobExecutionError::permanent("exploded"))
    });
    registry.register_typed("double", "default", |(n,): (i64,)| async move {
        Ok::<_, JobExecutionError>(n * 2)
    });

    broker.publish(&job("bad", "boom", "default")).await.unwrap();
    broker
        .publish(&taskhub_core::types::Job::with_id(
            "good",
            "double",
            "default",
            vec![json!(21)],
            serde_json::Map::new(),
        ))
        .await
        .unwrap();

    let worker = Arc::new(Worker::new(
        broker.clone(),
        Arc::new(registry),
        worker_config(1, &["default"]),
    ));
    let (cancel, handle) = spawn_worker(&worker);

    let reports = wait_for_reports(&worker, &["bad", "good"]).await;
    assert_eq!(reports[0].status, JobStatus::Failed);
    assert_eq!(
        reports[0].outcome,
        Some(JobOutcome::Failed("Permanent job failure: exploded".to_string()))
    );
    assert_eq!(reports[1].status, JobStatus::Successful);
    assert_eq!(reports[1].outcome, Some(JobOutcome::Successful(json!(42))));
    assert!(reports[1].time_started.is_some());
    assert!(reports[1].time_completed.is_some());

    assert_eq!(worker.state(), WorkerState::Running);
    assert_eq!(store.unacked_len().await.unwrap(), 0);

    cancel.cancel();
    handle.await.unwrap().unwrap();
    broker.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unknown_task_fails_and_is_acked() {
    let store = MemoryQueueStore::new();
    let broker = started_broker(&store, 1800).await;
    broker.publish(&job("j1", "nobody", "default")).await.unwrap();

    let worker = Arc::new(Worker::new(
        broker.clone(),
        Arc::new(TaskRegistry::new("default")),
        worker_config(1, &["default"]),
    ));
    let (cancel, handle) = spawn_worker(&worker);

    let reports = wait_for_reports(&worker, &["j1"]).await;
    assert_eq!(reports[0].status, JobStatus::Failed);
    assert_eq!(store.unacked_len().await.unwrap(), 0);

    cancel.cancel();
    handle.await.unwrap().unwrap();
    broker.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_events_and_state_lifecycle() {
    let store = MemoryQueueStore::new();
    let broker = started_broker(&store, 1800).await;
    let mut registry = TaskRegistry::new("default");
    registry.register_fn("noop", "default", |_job| async move {
        Ok::<_, JobExecutionError>(Value::Null)
    });
    broker.publish(&job("j1", "noop", "default")).await.unwrap();

    let worker = Arc::new(Worker::new(
        broker.clone(),
        Arc::new(registry),
        worker_config(1, &["default"]),
    ));
    assert_eq!(worker.state(), WorkerState::Created);
    let mut events = worker.events();
    let mut state = worker.watch_state();

    let (cancel, handle) = spawn_worker(&worker);
    state
        .wait_for(|s| *s == WorkerState::Running)
        .await
        .unwrap();
    wait_for_reports(&worker, &["j1"]).await;

    cancel.cancel();
    handle.await.unwrap().unwrap();
    assert_eq!(worker.state(), WorkerState::Stopped);

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event.payload);
    }
    assert_eq!(
        received.first(),
        Some(&WorkerEvent::WorkerStart {
            worker_name: "test-worker".to_string()
        })
    );
    assert!(received.contains(&WorkerEvent::JobStatusChange {
        job_id: "j1".to_string(),
        old_status: JobStatus::Pending,
        new_status: JobStatus::InProgress,
    }));
    assert!(received.contains(&WorkerEvent::JobStatusChange {
        job_id: "j1".to_string(),
        old_status: JobStatus::InProgress,
        new_status: JobStatus::Successful,
    }));
    assert_eq!(
        received.last(),
        Some(&WorkerEvent::WorkerShutdown {
            worker_name: "test-worker".to_string()
        })
    );
    broker.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_in_flight_job() {
    let store = MemoryQueueStore::new();
    let broker = started_broker(&store, 1800).await;
    let mut registry = TaskRegistry::new("default");
    registry.register_fn("slow", "default", |_job| async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok::<_, JobExecutionError>(json!("done"))
    });
    broker.publish(&job("j1", "slow", "default")).await.unwrap();

    let worker = Arc::new(Worker::new(
        broker.clone(),
        Arc::new(registry),
        worker_config(1, &["default"]),
    ));
    let (cancel, handle) = spawn_worker(&worker);

    let started = helpers::wait_until(Duration::from_secs(5), || {
        worker
            .report("j1")
            .map(|r| r.status == JobStatus::InProgress)
            .unwrap_or(false)
    })
    .await;
    assert!(started);

    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(worker.report("j1").unwrap().status, JobStatus::Successful);
    assert_eq!(store.unacked_len().await.unwrap(), 0);
    broker.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_job_past_grace_period_is_left_unacked() {
    let store = MemoryQueueStore::new();
    let broker = started_broker(&store, 1800).await;
    let mut registry = TaskRegistry::new("default");
    registry.register_fn("stuck", "default", |_job| async move {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok::<_, JobExecutionError>(Value::Null)
    });
    broker.publish(&job("j1", "stuck", "default")).await.unwrap();

    let mut config = worker_config(1, &["default"]);
    config.shutdown_grace_seconds = 1;
    let worker = Arc::new(Worker::new(broker.clone(), Arc::new(registry), config));
    let (cancel, handle) = spawn_worker(&worker);

    let started = helpers::wait_until(Duration::from_secs(5), || worker.report("j1").is_some()).await;
    assert!(started);

    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(worker.report("j1").unwrap().status, JobStatus::InProgress);
    assert_eq!(store.unacked_len().await.unwrap(), 1);
    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_worker_runs_only_once() {
    let store = MemoryQueueStore::new();
    let broker = started_broker(&store, 1800).await;
    let worker = Arc::new(Worker::new(
        broker.clone(),
        Arc::new(TaskRegistry::new("default")),
        worker_config(1, &["default"]),
    ));

    let (cancel, handle) = spawn_worker(&worker);
    cancel.cancel();
    handle.await.unwrap().unwrap();

    let err = worker.run(CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.kind, taskhub_core::error::ErrorKind::Internal);
    assert!(broker.is_ready());
    broker.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_job_finishing_as_grace_expires_is_not_dropped() {
    for round in 0..10 {
        let store = MemoryQueueStore::new();
        let broker = started_broker(&store, 1800).await;

        // The handler finishes exactly when the grace period runs out.
        let shutdown = CancellationToken::new();
        let completed = Arc::new(AtomicUsize::new(0));
        let mut registry = TaskRegistry::new("default");
        {
            let shutdown = shutdown.clone();
            let completed = Arc::clone(&completed);
            registry.register_fn("edge", "default", move |_job| {
                let shutdown = shutdown.clone();
                let completed = Arc::clone(&completed);
                async move {
                    shutdown.cancelled().await;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    completed.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, JobExecutionError>(Value::Null)
                }
            });
        }
        broker.publish(&job("j1", "edge", "default")).await.unwrap();

        let mut config = worker_config(1, &["default"]);
        config.shutdown_grace_seconds = 1;
        let worker = Arc::new(Worker::new(broker.clone(), Arc::new(registry), config));
        let (cancel, handle) = spawn_worker(&worker);

        let started = helpers::wait_until(Duration::from_secs(5), || {
            worker
                .report("j1")
                .map(|r| r.status == JobStatus::InProgress)
                .unwrap_or(false)
        })
        .await;
        assert!(started);

        shutdown.cancel();
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let status = worker.report("j1").unwrap().status;
        let unacked = store.unacked_len().await.unwrap();
        if completed.load(Ordering::SeqCst) == 1 {
            assert_eq!(status, JobStatus::Successful, "round {round}");
            assert_eq!(unacked, 0, "round {round}");
        } else {
            assert_eq!(status, JobStatus::InProgress, "round {round}");
            assert_eq!(unacked, 1, "round {round}");
        }
        broker.close().await.unwrap();
    }
}

/// Broker that counts subscription streams still alive.
#[derive(Debug)]
struct CountingBroker {
    inner: Arc<MemoryBroker>,
    open_streams: Arc<AtomicUsize>,
}

struct StreamGuard(Arc<AtomicUsize>);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Broker for CountingBroker {
    async fn start(&self) -> AppResult<()> {
        self.inner.start().await
    }

    async fn close(&self) -> AppResult<()> {
        self.inner.close().await
    }

    async fn publish(&self, job: &Job) -> AppResult<()> {
        self.inner.publish(job).await
    }

    async fn subscribe(&self, queues: &[String]) -> AppResult<JobStream> {
        let stream = self.inner.subscribe(queues).await?;
        self.open_streams.fetch_add(1, Ordering::SeqCst);
        let guard = StreamGuard(Arc::clone(&self.open_streams));
        Ok(stream
            .map(move |item| {
                let _held = &guard;
                item
            })
            .boxed())
    }

    async fn ack(&self, job_id: &str) -> AppResult<()> {
        self.inner.ack(job_id).await
    }

    fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }
}

#[tokio::test(start_paused = true)]
async fn test_subscription_released_before_draining() {
    let store = MemoryQueueStore::new();
    let inner = started_broker(&store, 1800).await;
    let open_streams = Arc::new(AtomicUsize::new(0));
    let broker = Arc::new(CountingBroker {
        inner: Arc::clone(&inner),
        open_streams: Arc::clone(&open_streams),
    });

    let mut registry = TaskRegistry::new("default");
    registry.register_fn("stuck", "default", |_job| async move {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok::<_, JobExecutionError>(Value::Null)
    });
    broker.publish(&job("j1", "stuck", "default")).await.unwrap();

    let mut config = worker_config(2, &["default"]);
    config.shutdown_grace_seconds = 60;
    let worker = Arc::new(Worker::new(broker.clone(), Arc::new(registry), config));
    let mut state = worker.watch_state();
    let (cancel, handle) = spawn_worker(&worker);

    let started = helpers::wait_until(Duration::from_secs(5), || worker.report("j1").is_some()).await;
    assert!(started);
    assert_eq!(open_streams.load(Ordering::SeqCst), 1);

    cancel.cancel();
    state
        .wait_for(|s| *s == WorkerState::Draining)
        .await
        .unwrap();
    assert_eq!(open_streams.load(Ordering::SeqCst), 0);

    // A job published while draining stays queued and tracked.
    broker.publish(&job("j2", "stuck", "default")).await.unwrap();
    assert_eq!(store.queue_len("default").await.unwrap(), 1);

    handle.await.unwrap().unwrap();
    assert_eq!(open_streams.load(Ordering::SeqCst), 0);
    assert_eq!(store.unacked_len().await.unwrap(), 2);
    inner.close().await.unwrap();
}
