//! Store-native operations the broker is built on.

use std::time::Duration;

use async_trait::async_trait;

use crate::result::AppResult;

/// Trait for queue store backends (Redis or in-memory).
///
/// Layout: one list per queue, one hash of unacked entries keyed by job id,
/// and one time-ordered index of unacked job ids scored by enqueue time
/// (seconds since the Unix epoch). All payloads are opaque strings.
#[async_trait]
pub trait QueueStore: Send + Sync + std::fmt::Debug + 'static {
    /// Open the connection. Idempotent.
    async fn connect(&self) -> AppResult<()>;

    /// Release the connection. Safe when never connected.
    async fn disconnect(&self);

    /// Check that the store is reachable.
    async fn health_check(&self) -> AppResult<bool>;

    /// Push `payload` to the tail of `queue`, then record `job_id` as unacked
    /// with `entry` and score `now`.
    async fn enqueue(
        &self,
        queue: &str,
        job_id: &str,
        payload: &str,
        entry: &str,
        now: f64,
    ) -> AppResult<()>;

    /// Record `job_id` as unacked unless it is already tracked.
    /// Returns `true` when a new record was written.
    async fn track_if_absent(&self, job_id: &str, entry: &str, now: f64) -> AppResult<bool>;

    /// Remove `job_id` from both unacked structures.
    /// Returns `true` when an entry existed.
    async fn remove_unacked(&self, job_id: &str) -> AppResult<bool>;

    /// All unacked `(job_id, entry)` pairs with a score at or below `older_than`.
    async fn stale_unacked(&self, older_than: f64) -> AppResult<Vec<(String, String)>>;

    /// Atomically drop the unacked record for `job_id`, push `payload` back
    /// onto `queue`, and record it again with score `now`.
    ///
    /// Does nothing and returns `false` when the record is already gone.
    async fn redeliver(
        &self,
        job_id: &str,
        queue: &str,
        payload: &str,
        entry: &str,
        now: f64,
    ) -> AppResult<bool>;

    /// Acquire the named lock for `lease` if nobody holds it.
    async fn try_lock(&self, name: &str, token: &str, lease: Duration) -> AppResult<bool>;

    /// Release the named lock if it is still held by `token`.
    /// Returns `false` when the lock had already expired or changed hands.
    async fn unlock(&self, name: &str, token: &str) -> AppResult<bool>;

    /// Open a consumer for blocking pops.
    async fn open_consumer(&self) -> AppResult<Box<dyn QueueConsumer>>;

    /// Number of payloads waiting in `queue`.
    async fn queue_len(&self, queue: &str) -> AppResult<u64>;

    /// Number of unacked records.
    async fn unacked_len(&self) -> AppResult<u64>;
}

/// A handle able to block on several queues at once.
#[async_trait]
pub trait QueueConsumer: Send + std::fmt::Debug {
    /// Pop the head of the first non-empty queue in `queues`, waiting
    /// indefinitely while all are empty. Returns `(queue, payload)`.
    async fn pop(&mut self, queues: &[String]) -> AppResult<(String, String)>;
}
