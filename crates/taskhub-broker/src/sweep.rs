//! Visibility-timeout sweep.
//!
//! Jobs that stay unacked longer than the visibility timeout are pushed back
//! onto their queue. Only one process sweeps at a time; the others find the
//! lock taken and skip the cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskhub_core::error::{AppError, ErrorKind};
use taskhub_core::result::AppResult;
use taskhub_core::traits::queue_store::QueueStore;
use taskhub_core::types::UnackedEntry;

use crate::now_score;

/// Name of the lock guarding a sweep cycle.
pub const SWEEP_LOCK: &str = "sweep";

/// Outcome of one sweep cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Jobs pushed back onto their queue.
    pub redelivered: usize,
    /// Unreadable unacked entries that were dropped.
    pub discarded: usize,
    /// Another process held the lock, so nothing was examined.
    pub skipped: bool,
}

impl SweepReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Runs sweep cycles against a store.
#[derive(Debug)]
pub(crate) struct Sweeper<S: QueueStore> {
    store: Arc<S>,
    /// Lock owner token, unique per broker instance.
    token: String,
    unacked_ttl: Duration,
    lock_lease: Duration,
}

impl<S: QueueStore> Sweeper<S> {
    pub(crate) fn new(
        store: Arc<S>,
        token: impl Into<String>,
        unacked_ttl: Duration,
        lock_lease: Duration,
    ) -> Self {
        Self {
            store,
            token: token.into(),
            unacked_ttl,
            lock_lease,
        }
    }

    /// Sweep every `interval` until `cancel` fires, then sweep once more.
    pub(crate) async fn run(self, interval: Duration, cancel: CancellationToken) {
        debug!(interval_secs = interval.as_secs(), "Sweeper started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            self.run_logged().await;
        }
        self.run_logged().await;
        debug!("Sweeper stopped");
    }

    async fn run_logged(&self) {
        if let Err(e) = self.run_cycle().await {
            warn!(error = %e, "Sweep cycle failed, retrying next interval");
        }
    }

    /// Run one cycle: lock, redeliver stale jobs, unlock.
    pub(crate) async fn run_cycle(&self) -> AppResult<SweepReport> {
        match self.store.health_check().await {
            Ok(true) => {}
            Ok(false) => warn!("Store health check failed before sweep"),
            Err(e) => warn!(error = %e, "Store health check failed before sweep"),
        }

        match self.acquire().await {
            Ok(()) => {}
            Err(e) if e.kind == ErrorKind::LockNotAcquired => {
                debug!("Sweep lock held elsewhere, skipping cycle");
                return Ok(SweepReport::skipped());
            }
            Err(e) => return Err(e),
        }

        let result = self.redeliver_stale().await;

        match self.store.unlock(SWEEP_LOCK, &self.token).await {
            Ok(true) => {}
            Ok(false) => debug!("Sweep lock expired before release"),
            Err(e) => warn!(error = %e, "Failed to release sweep lock"),
        }

        result
    }

    async fn acquire(&self) -> AppResult<()> {
        if self
            .store
            .try_lock(SWEEP_LOCK, &self.token, self.lock_lease)
            .await?
        {
            Ok(())
        } else {
            Err(AppError::lock_not_acquired("Sweep lock is held"))
        }
    }

    async fn redeliver_stale(&self) -> AppResult<SweepReport> {
        let cutoff = now_score() - self.unacked_ttl.as_secs_f64();
        let stale = self.store.stale_unacked(cutoff).await?;
        let mut report = SweepReport::default();

        for (job_id, raw) in stale {
            let entry = match UnackedEntry::decode(&raw) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Dropping unreadable unacked entry");
                    self.store.remove_unacked(&job_id).await?;
                    report.discarded += 1;
                    continue;
                }
            };

            let payload = entry.job.encode()?;
            let pushed = self
                .store
                .redeliver(&job_id, &entry.queue, &payload, &raw, now_score())
                .await?;
            if pushed {
                info!(job_id = %job_id, queue = %entry.queue, "Redelivered stale job");
                report.redelivered += 1;
            } else {
                debug!(job_id = %job_id, "Job acked during sweep");
            }
        }

        if report.redelivered > 0 || report.discarded > 0 {
            info!(
                redelivered = report.redelivered,
                discarded = report.discarded,
                "Sweep cycle finished"
            );
        }
        Ok(report)
    }
}
