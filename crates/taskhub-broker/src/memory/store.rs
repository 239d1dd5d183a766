//! In-memory queue store using dashmap.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use taskhub_core::error::AppError;
use taskhub_core::result::AppResult;
use taskhub_core::traits::queue_store::{QueueConsumer, QueueStore};

/// In-memory queue store.
///
/// Clones share the same underlying data, so several brokers built from
/// clones of one store behave like processes sharing one Redis instance.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueueStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Queue name to FIFO list of payloads.
    queues: DashMap<String, VecDeque<String>>,
    /// Job id to unacked entry and enqueue score.
    unacked: DashMap<String, UnackedSlot>,
    /// Lock name to current holder.
    locks: DashMap<String, LockLease>,
    /// Woken on every push and on outage changes.
    pushed: Notify,
    /// Simulated outage switch.
    offline: AtomicBool,
}

#[derive(Debug, Clone)]
struct UnackedSlot {
    entry: String,
    score: f64,
}

#[derive(Debug, Clone)]
struct LockLease {
    token: String,
    expires_at: Instant,
}

impl MemoryQueueStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store becoming unreachable (or reachable again).
    ///
    /// While offline every operation fails with a connection error and
    /// pending blocking pops are released with that error.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
        self.inner.pushed.notify_waiters();
    }

    /// Score recorded for an unacked job, if tracked.
    pub fn unacked_score(&self, job_id: &str) -> Option<f64> {
        self.inner.unacked.get(job_id).map(|slot| slot.score)
    }
}

impl Inner {
    fn ensure_online(&self) -> AppResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(AppError::connection("Memory store is offline"));
        }
        Ok(())
    }

    fn push(&self, queue: &str, payload: &str) {
        self.queues
            .entry(queue.to_string())
            .or_default()
            .push_back(payload.to_string());
        self.pushed.notify_waiters();
    }

    fn try_pop(&self, queues: &[String]) -> Option<(String, String)> {
        for queue in queues {
            if let Some(mut list) = self.queues.get_mut(queue) {
                if let Some(payload) = list.pop_front() {
                    return Some((queue.clone(), payload));
                }
            }
        }
        None
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn connect(&self) -> AppResult<()> {
        self.inner.ensure_online()
    }

    async fn disconnect(&self) {
        // Clones may still be in use by other brokers.
    }

    async fn health_check(&self) -> AppResult<bool> {
        self.inner.ensure_online()?;
        Ok(true)
    }

    async fn enqueue(
        &self,
        queue: &str,
        job_id: &str,
        payload: &str,
        entry: &str,
        now: f64,
    ) -> AppResult<()> {
        self.inner.ensure_online()?;
        self.inner.unacked.insert(
            job_id.to_string(),
            UnackedSlot {
                entry: entry.to_string(),
                score: now,
            },
        );
        self.inner.push(queue, payload);
        Ok(())
    }

    async fn track_if_absent(&self, job_id: &str, entry: &str, now: f64) -> AppResult<bool> {
        self.inner.ensure_online()?;
        match self.inner.unacked.entry(job_id.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                vacant.insert(UnackedSlot {
                    entry: entry.to_string(),
                    score: now,
                });
                Ok(true)
            }
        }
    }

    async fn remove_unacked(&self, job_id: &str) -> AppResult<bool> {
        self.inner.ensure_online()?;
        Ok(self.inner.unacked.remove(job_id).is_some())
    }

    async fn stale_unacked(&self, older_than: f64) -> AppResult<Vec<(String, String)>> {
        self.inner.ensure_online()?;
        let mut stale: Vec<(f64, String, String)> = self
            .inner
            .unacked
            .iter()
            .filter(|slot| slot.score <= older_than)
            .map(|slot| (slot.score, slot.key().clone(), slot.entry.clone()))
            .collect();
        stale.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(stale.into_iter().map(|(_, id, entry)| (id, entry)).collect())
    }

    async fn redeliver(
        &self,
        job_id: &str,
        queue: &str,
        payload: &str,
        entry: &str,
        now: f64,
    ) -> AppResult<bool> {
        self.inner.ensure_online()?;
        if self.inner.unacked.remove(job_id).is_none() {
            return Ok(false);
        }
        self.inner.unacked.insert(
            job_id.to_string(),
            UnackedSlot {
                entry: entry.to_string(),
                score: now,
            },
        );
        self.inner.push(queue, payload);
        Ok(true)
    }

    async fn try_lock(&self, name: &str, token: &str, lease: Duration) -> AppResult<bool> {
        self.inner.ensure_online()?;
        let now = Instant::now();
        let fresh = LockLease {
            token: token.to_string(),
            expires_at: now + lease,
        };
        match self.inner.locks.entry(name.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().expires_at > now {
                    return Ok(false);
                }
                debug!(lock = name, "Taking over expired lock");
                held.insert(fresh);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn unlock(&self, name: &str, token: &str) -> AppResult<bool> {
        self.inner.ensure_online()?;
        let now = Instant::now();
        match self
            .inner
            .locks
            .remove_if(name, |_, lease| lease.token == token)
        {
            Some((_, lease)) => Ok(lease.expires_at > now),
            None => Ok(false),
        }
    }

    async fn open_consumer(&self) -> AppResult<Box<dyn QueueConsumer>> {
        self.inner.ensure_online()?;
        Ok(Box::new(MemoryConsumer {
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn queue_len(&self, queue: &str) -> AppResult<u64> {
        self.inner.ensure_online()?;
        Ok(self
            .inner
            .queues
            .get(queue)
            .map(|list| list.len() as u64)
            .unwrap_or(0))
    }

    async fn unacked_len(&self) -> AppResult<u64> {
        self.inner.ensure_online()?;
        Ok(self.inner.unacked.len() as u64)
    }
}

/// Consumer over a [`MemoryQueueStore`].
///
/// A payload is removed from its list only in the same poll that returns
/// it, so dropping a pending `pop` never loses an item.
#[derive(Debug)]
pub struct MemoryConsumer {
    inner: Arc<Inner>,
}

#[async_trait]
impl QueueConsumer for MemoryConsumer {
    async fn pop(&mut self, queues: &[String]) -> AppResult<(String, String)> {
        loop {
            let notified = self.inner.pushed.notified();
            tokio::pin!(notified);
            // Register before checking so a push in between still wakes us.
            notified.as_mut().enable();

            self.inner.ensure_online()?;
            if let Some(popped) = self.inner.try_pop(queues) {
                return Ok(popped);
            }
            notified.await;
        }
    }
}
