//! Broker contract shared by every transport.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::result::AppResult;
use crate::types::job::Job;

/// Lazy, potentially infinite feed of jobs drawn from a set of queues.
///
/// The first `Err` item ends the feed; callers re-subscribe to continue.
pub type JobStream = BoxStream<'static, AppResult<Job>>;

/// Durable handoff of jobs between producers and consumers.
#[async_trait]
pub trait Broker: Send + Sync + std::fmt::Debug + 'static {
    /// Establish transport connectivity. A no-op when already started.
    async fn start(&self) -> AppResult<()>;

    /// Stop background work and release the transport.
    ///
    /// Safe to call when `start()` never succeeded.
    async fn close(&self) -> AppResult<()>;

    /// Append a job to the tail of its queue and record it as unacked.
    async fn publish(&self, job: &Job) -> AppResult<()>;

    /// Consume jobs from `queues` in round-robin order.
    async fn subscribe(&self, queues: &[String]) -> AppResult<JobStream>;

    /// Remove a job from the unacked record. Unknown ids are ignored.
    async fn ack(&self, job_id: &str) -> AppResult<()>;

    /// Whether `start()` has succeeded and `close()` has not been called.
    fn is_ready(&self) -> bool;
}
