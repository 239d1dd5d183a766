//! Worker runtime: polls the broker for jobs and executes them.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use taskhub_core::config::WorkerConfig;
use taskhub_core::error::AppError;
use taskhub_core::events::{DomainEvent, WorkerEvent};
use taskhub_core::result::AppResult;
use taskhub_core::traits::broker::{Broker, JobStream};
use taskhub_core::types::{Job, JobOutcome, JobReport, JobStatus};
use taskhub_core::types::job::random_id;

use crate::registry::TaskRegistry;
use crate::scheduler::{ScheduledTask, Scheduler};

/// Capacity of the event broadcast channel
const EVENT_CAPACITY: usize = 256;

/// Lifecycle of a [`Worker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Built, `run` not called yet.
    Created,
    /// Emitting the start event and spawning scheduler loops.
    Starting,
    /// Polling for jobs.
    Running,
    /// Shutdown requested; fetching stopped, scheduler loops winding down.
    Stopping,
    /// Waiting for in-flight jobs.
    Draining,
    /// Finished.
    Stopped,
}

/// State shared between the poll loop and job tasks
struct Shared {
    name: String,
    broker: Arc<dyn Broker>,
    registry: Arc<TaskRegistry>,
    queues: Vec<String>,
    /// One subscription shared by every fetch, opened lazily.
    subscription: tokio::sync::Mutex<Option<JobStream>>,
    events: broadcast::Sender<DomainEvent>,
    reports: Mutex<VecDeque<JobReport>>,
    report_history: usize,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("name", &self.name)
            .field("broker", &self.broker)
            .field("queues", &self.queues)
            .field("report_history", &self.report_history)
            .finish_non_exhaustive()
    }
}

/// Executes jobs from the broker with bounded concurrency and publishes
/// scheduled tasks.
#[derive(Debug)]
pub struct Worker {
    shared: Arc<Shared>,
    config: WorkerConfig,
    scheduler: Scheduler,
    state: watch::Sender<WorkerState>,
}

impl Worker {
    /// Create a worker. The broker is started by [`Worker::run`] if needed.
    pub fn new(broker: Arc<dyn Broker>, registry: Arc<TaskRegistry>, config: WorkerConfig) -> Self {
        let name = if config.name.is_empty() {
            format!("worker-{}", &random_id()[..8])
        } else {
            config.name.clone()
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(WorkerState::Created);

        Self {
            shared: Arc::new(Shared {
                name,
                broker,
                registry,
                queues: config.queues.clone(),
                subscription: tokio::sync::Mutex::new(None),
                events,
                reports: Mutex::new(VecDeque::new()),
                report_history: config.report_history,
            }),
            config,
            scheduler: Scheduler::new(),
            state,
        }
    }

    /// Publish `task` on its schedule while the worker runs.
    pub fn schedule(&mut self, task: ScheduledTask) {
        self.scheduler.add(task);
    }

    /// Worker name used in events and logs
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current lifecycle state
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Watch lifecycle state changes
    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Receive worker and job events
    pub fn events(&self) -> broadcast::Receiver<DomainEvent> {
        self.shared.events.subscribe()
    }

    /// Snapshot of the most recent job reports, oldest first
    pub fn reports(&self) -> Vec<JobReport> {
        self.shared.reports().iter().cloned().collect()
    }

    /// Report for one job, if still held
    pub fn report(&self, job_id: &str) -> Option<JobReport> {
        self.shared
            .reports()
            .iter()
            .rev()
            .find(|r| r.job_id == job_id)
            .cloned()
    }

    /// Run until `cancel` fires, then drain and stop.
    pub async fn run(&self, cancel: CancellationToken) -> AppResult<()> {
        if self.state() != WorkerState::Created {
            return Err(AppError::internal(format!(
                "Worker '{}' has already been run",
                self.shared.name
            )));
        }
        self.set_state(WorkerState::Starting);

        if let Err(e) = self.shared.broker.start().await {
            self.set_state(WorkerState::Stopped);
            return Err(e);
        }

        let name = self.shared.name.clone();
        self.shared.emit(WorkerEvent::WorkerStart {
            worker_name: name.clone(),
        });

        let schedule_cancel = cancel.child_token();
        let mut schedules = JoinSet::new();
        self.scheduler
            .spawn_all(&self.shared.broker, &schedule_cancel, &mut schedules);

        info!(
            worker = %name,
            concurrency = self.config.concurrency,
            poll_rate_ms = self.config.poll_rate_ms,
            queues = ?self.shared.queues,
            scheduled = self.scheduler.len(),
            "Worker started"
        );
        self.set_state(WorkerState::Running);

        let slots = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let kill = CancellationToken::new();
        let mut jobs = JoinSet::new();

        loop {
            while let Some(finished) = jobs.try_join_next() {
                log_join(finished);
            }

            let available = slots.available_permits();
            if available == 0 {
                trace!(worker = %name, "All worker slots occupied");
            }
            for _ in 0..available {
                let Ok(permit) = Arc::clone(&slots).try_acquire_owned() else {
                    break;
                };
                jobs.spawn(fetch_and_execute(
                    Arc::clone(&self.shared),
                    permit,
                    cancel.clone(),
                    kill.clone(),
                ));
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_rate()) => {}
            }
        }

        self.set_state(WorkerState::Stopping);
        info!(worker = %name, "Worker received shutdown signal");
        // Fetch tasks let go of the lock on cancel; dropping the stream
        // releases any blocking pop it still holds open.
        self.shared.subscription.lock().await.take();
        schedule_cancel.cancel();
        while let Some(finished) = schedules.join_next().await {
            log_join(finished);
        }

        self.set_state(WorkerState::Draining);
        info!(worker = %name, in_flight = jobs.len(), "Waiting for in-flight jobs to complete");
        self.drain(&mut jobs, &kill).await;

        self.shared.emit(WorkerEvent::WorkerShutdown {
            worker_name: name.clone(),
        });
        self.set_state(WorkerState::Stopped);
        info!(worker = %name, "Worker shut down complete");
        Ok(())
    }

    /// Await in-flight jobs for the grace period, then cancel the rest.
    async fn drain(&self, jobs: &mut JoinSet<()>, kill: &CancellationToken) {
        let grace = self.config.shutdown_grace();
        let drained = tokio::time::timeout(grace, async {
            while let Some(finished) = jobs.join_next().await {
                log_join(finished);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                worker = %self.shared.name,
                remaining = jobs.len(),
                grace_secs = grace.as_secs(),
                "Grace period elapsed, cancelling in-flight jobs"
            );
            kill.cancel();
            while let Some(finished) = jobs.join_next().await {
                log_join(finished);
            }
        }
    }

    fn set_state(&self, state: WorkerState) {
        let old = self.state.send_replace(state);
        debug!(worker = %self.shared.name, from = ?old, to = ?state, "Worker state changed");
    }
}

impl Shared {
    fn reports(&self) -> MutexGuard<'_, VecDeque<JobReport>> {
        self.reports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: WorkerEvent) {
        // No receivers is fine.
        let _ = self.events.send(DomainEvent::new(event));
    }

    /// Pull the next job from the shared subscription.
    ///
    /// Returns `None` when the subscription failed or ended; the next call
    /// opens a new one.
    async fn next_job(&self) -> Option<Job> {
        let mut guard = self.subscription.lock().await;
        if guard.is_none() {
            match self.broker.subscribe(&self.queues).await {
                Ok(stream) => *guard = Some(stream),
                Err(e) => {
                    error!(worker = %self.name, error = %e, "Failed to subscribe to queues");
                    return None;
                }
            }
        }

        let stream = guard.as_mut()?;
        match stream.next().await {
            Some(Ok(job)) => Some(job),
            Some(Err(e)) => {
                error!(worker = %self.name, error = %e, "Subscription failed, resubscribing");
                *guard = None;
                None
            }
            None => {
                *guard = None;
                None
            }
        }
    }

    fn record_received(&self, job: &Job) {
        if self.report_history == 0 {
            return;
        }
        let mut reports = self.reports();
        while reports.len() >= self.report_history {
            reports.pop_front();
        }
        reports.push_back(JobReport::pending(job));
    }

    /// Move a job's report to `status` and emit the change.
    fn transition(&self, job_id: &str, old_status: JobStatus, status: JobStatus, outcome: Option<JobOutcome>) {
        {
            let mut reports = self.reports();
            if let Some(report) = reports.iter_mut().rev().find(|r| r.job_id == job_id) {
                report.status = status;
                match status {
                    JobStatus::InProgress => report.time_started = Some(Utc::now()),
                    JobStatus::Successful | JobStatus::Failed => {
                        report.time_completed = Some(Utc::now());
                        report.outcome = outcome;
                    }
                    JobStatus::Pending => {}
                }
            }
        }
        self.emit(WorkerEvent::JobStatusChange {
            job_id: job_id.to_string(),
            old_status,
            new_status: status,
        });
    }

    /// Run one job to completion and ack it.
    async fn process(&self, job: Job, kill: CancellationToken) {
        self.record_received(&job);
        self.transition(&job.id, JobStatus::Pending, JobStatus::InProgress, None);
        info!(worker = %self.name, job_id = %job.id, task = %job.name, queue = %job.queue, "Processing job");

        let registry = Arc::clone(&self.registry);
        let handler_job = job.clone();
        let mut handler = tokio::spawn(async move { registry.execute(&handler_job).await });

        let joined = tokio::select! {
            biased;
            joined = &mut handler => joined,
            _ = kill.cancelled() => {
                // A handler that finished before the abort landed still counts.
                handler.abort();
                (&mut handler).await
            }
        };
        let outcome = match joined {
            Ok(Ok(value)) => {
                info!(worker = %self.name, job_id = %job.id, "Job completed successfully");
                JobOutcome::Successful(value)
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                let err = AppError::from(e);
                error!(worker = %self.name, job_id = %job.id, error = %err, "Job failed");
                JobOutcome::Failed(message)
            }
            Err(e) if e.is_cancelled() => {
                warn!(
                    worker = %self.name,
                    job_id = %job.id,
                    "Job cancelled before completion, leaving it for redelivery"
                );
                return;
            }
            Err(e) => {
                let err = AppError::job_execution(format!("Task panicked: {e}"));
                error!(worker = %self.name, job_id = %job.id, error = %err, "Job failed");
                JobOutcome::Failed(err.message)
            }
        };
        let status = outcome.status();
        self.transition(&job.id, JobStatus::InProgress, status, Some(outcome));

        // Spawned so that cancelling this task cannot interrupt the ack.
        let broker = Arc::clone(&self.broker);
        let job_id = job.id.clone();
        match tokio::spawn(async move { broker.ack(&job_id).await }).await {
            Ok(Ok(())) => debug!(worker = %self.name, job_id = %job.id, "Job acked"),
            Ok(Err(e)) => {
                error!(worker = %self.name, job_id = %job.id, error = %e, "Failed to ack job")
            }
            Err(e) => error!(worker = %self.name, job_id = %job.id, error = %e, "Ack task failed"),
        }
    }
}

/// Slot task: wait for one job, then run it while holding the slot.
async fn fetch_and_execute(
    shared: Arc<Shared>,
    _permit: OwnedSemaphorePermit,
    stop: CancellationToken,
    kill: CancellationToken,
) {
    let job = tokio::select! {
        biased;
        _ = stop.cancelled() => return,
        job = shared.next_job() => job,
    };
    let Some(job) = job else {
        return;
    };
    shared.process(job, kill).await;
}

fn log_join(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(error = %e, "Worker task panicked");
        }
    }
}
