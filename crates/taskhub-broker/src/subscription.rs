//! Round-robin consumption across several queues.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use tracing::{debug, warn};

use taskhub_core::result::AppResult;
use taskhub_core::traits::broker::JobStream;
use taskhub_core::traits::queue_store::{QueueConsumer, QueueStore};
use taskhub_core::types::{Job, UnackedEntry};

use crate::now_score;

/// Rotating queue order for one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundRobin {
    order: VecDeque<String>,
}

impl RoundRobin {
    /// Start with `queues` in the given order.
    pub fn new(queues: &[String]) -> Self {
        Self {
            order: queues.iter().cloned().collect(),
        }
    }

    /// Move the first queue to the back and return the resulting order.
    pub fn rotate(&mut self) -> Vec<String> {
        self.order.rotate_left(1.min(self.order.len()));
        self.order.iter().cloned().collect()
    }

    /// Current order without rotating.
    pub fn order(&self) -> Vec<String> {
        self.order.iter().cloned().collect()
    }
}

/// State behind one [`JobStream`].
#[derive(Debug)]
pub(crate) struct Subscription<S: QueueStore> {
    store: Arc<S>,
    consumer: Box<dyn QueueConsumer>,
    order: RoundRobin,
    /// Job id to queue, shared with the owning broker.
    in_flight: Arc<DashMap<String, String>>,
}

impl<S: QueueStore> Subscription<S> {
    pub(crate) fn new(
        store: Arc<S>,
        consumer: Box<dyn QueueConsumer>,
        queues: &[String],
        in_flight: Arc<DashMap<String, String>>,
    ) -> Self {
        Self {
            store,
            consumer,
            order: RoundRobin::new(queues),
            in_flight,
        }
    }

    /// Block until the next decodable job arrives and lease it.
    async fn next_job(&mut self) -> AppResult<Job> {
        loop {
            let order = self.order.rotate();
            let (queue, payload) = self.consumer.pop(&order).await?;

            let job = match Job::decode(&payload) {
                Ok(job) => job,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Discarding undecodable payload");
                    continue;
                }
            };

            let entry = UnackedEntry::for_job(&job).encode()?;
            if self
                .store
                .track_if_absent(&job.id, &entry, now_score())
                .await?
            {
                debug!(job_id = %job.id, queue = %queue, "Tracked job missing from unacked record");
            }
            self.in_flight.insert(job.id.clone(), queue.clone());

            debug!(job_id = %job.id, queue = %queue, "Fetched job");
            return Ok(job);
        }
    }

    /// Turn the subscription into a stream that ends after its first error.
    pub(crate) fn into_stream(self) -> JobStream {
        futures::stream::unfold(Some(self), |state| async move {
            let mut subscription = state?;
            match subscription.next_job().await {
                Ok(job) => Some((Ok(job), Some(subscription))),
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed()
    }
}
