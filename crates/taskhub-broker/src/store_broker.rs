//! Broker implementation shared by every queue store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use taskhub_core::config::BrokerConfig;
use taskhub_core::error::AppError;
use taskhub_core::result::AppResult;
use taskhub_core::traits::broker::{Broker, JobStream};
use taskhub_core::traits::queue_store::QueueStore;
use taskhub_core::types::{Job, UnackedEntry};

use crate::now_score;
use crate::subscription::Subscription;
use crate::sweep::{SweepReport, Sweeper};

/// Queue depths and unacked count at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    /// `(queue, waiting jobs)` in the order requested.
    pub queues: Vec<(String, u64)>,
    /// Jobs published or leased but not yet acked.
    pub unacked: u64,
}

/// Running sweep task and the token that stops it.
#[derive(Debug)]
struct SweepHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// At-least-once broker on top of a [`QueueStore`].
#[derive(Debug)]
pub struct StoreBroker<S: QueueStore> {
    store: Arc<S>,
    config: BrokerConfig,
    ready: AtomicBool,
    /// Jobs this instance handed out and has not acked, id to queue.
    in_flight: Arc<DashMap<String, String>>,
    sweep: Mutex<Option<SweepHandle>>,
    /// Lock owner token for this instance.
    instance_id: String,
}

impl<S: QueueStore> StoreBroker<S> {
    /// Create a broker over `store`. Nothing is connected until `start()`.
    pub fn new(store: S, config: BrokerConfig) -> Self {
        Self {
            store: Arc::new(store),
            config,
            ready: AtomicBool::new(false),
            in_flight: Arc::new(DashMap::new()),
            sweep: Mutex::new(None),
            instance_id: Uuid::new_v4().simple().to_string(),
        }
    }

    /// Ids of jobs handed out by this instance and not yet acked.
    pub fn in_flight(&self) -> Vec<String> {
        self.in_flight.iter().map(|e| e.key().clone()).collect()
    }

    /// Run one sweep cycle now.
    pub async fn sweep_now(&self) -> AppResult<SweepReport> {
        self.ensure_ready()?;
        self.sweeper().run_cycle().await
    }

    /// Depth of each queue in `queues` plus the unacked count.
    pub async fn stats(&self, queues: &[String]) -> AppResult<BrokerStats> {
        self.ensure_ready()?;
        let mut depths = Vec::with_capacity(queues.len());
        for queue in queues {
            depths.push((queue.clone(), self.store.queue_len(queue).await?));
        }
        Ok(BrokerStats {
            queues: depths,
            unacked: self.store.unacked_len().await?,
        })
    }

    fn sweeper(&self) -> Sweeper<S> {
        Sweeper::new(
            Arc::clone(&self.store),
            self.instance_id.clone(),
            self.config.unacked_ttl(),
            self.config.lock_lease(),
        )
    }

    fn ensure_ready(&self) -> AppResult<()> {
        if self.ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::not_connected("Broker has not been started"))
        }
    }
}

#[async_trait]
impl<S: QueueStore> Broker for StoreBroker<S> {
    async fn start(&self) -> AppResult<()> {
        let mut sweep = self.sweep.lock().await;
        if self.ready.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.store.connect().await?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            self.sweeper()
                .run(self.config.sweep_interval(), cancel.clone()),
        );
        *sweep = Some(SweepHandle { cancel, task });
        self.ready.store(true, Ordering::SeqCst);

        info!(
            instance = %self.instance_id,
            sweep_interval_secs = self.config.sweep_interval_seconds,
            unacked_ttl_secs = self.config.unacked_ttl_seconds,
            "Broker started"
        );
        Ok(())
    }

    async fn close(&self) -> AppResult<()> {
        let handle = self.sweep.lock().await.take();
        self.ready.store(false, Ordering::SeqCst);

        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                warn!(error = %e, "Sweep task ended abnormally");
            }
        }

        let leftover = self.in_flight();
        self.in_flight.clear();
        if !leftover.is_empty() {
            warn!(
                count = leftover.len(),
                job_ids = ?leftover,
                "Closing with unacked jobs; they will be redelivered after the visibility timeout"
            );
        }

        self.store.disconnect().await;
        info!(instance = %self.instance_id, "Broker closed");
        Ok(())
    }

    async fn publish(&self, job: &Job) -> AppResult<()> {
        self.ensure_ready()?;
        job.validate()?;

        let payload = job.encode()?;
        let entry = UnackedEntry::for_job(job).encode()?;
        self.store
            .enqueue(&job.queue, &job.id, &payload, &entry, now_score())
            .await?;

        debug!(job_id = %job.id, queue = %job.queue, task = %job.name, "Published job");
        Ok(())
    }

    async fn subscribe(&self, queues: &[String]) -> AppResult<JobStream> {
        self.ensure_ready()?;
        if queues.is_empty() {
            return Err(AppError::validation("Subscribe needs at least one queue"));
        }
        if let Some(empty) = queues.iter().find(|q| q.is_empty()) {
            return Err(AppError::validation(format!(
                "Invalid queue name '{empty}'"
            )));
        }

        let consumer = self.store.open_consumer().await?;
        debug!(queues = ?queues, "Opened subscription");
        Ok(Subscription::new(
            Arc::clone(&self.store),
            consumer,
            queues,
            Arc::clone(&self.in_flight),
        )
        .into_stream())
    }

    async fn ack(&self, job_id: &str) -> AppResult<()> {
        self.ensure_ready()?;
        let removed = self.store.remove_unacked(job_id).await?;
        self.in_flight.remove(job_id);
        if removed {
            debug!(job_id = %job_id, "Acked job");
        } else {
            debug!(job_id = %job_id, "Ack for unknown job ignored");
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}
