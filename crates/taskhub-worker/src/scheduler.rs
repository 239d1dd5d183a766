//! Periodic task scheduling.
//!
//! Every scheduled task gets its own loop that sleeps until the next fire
//! time and publishes a job for it.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use croner::Cron;
use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use taskhub_core::error::AppError;
use taskhub_core::result::AppResult;
use taskhub_core::traits::broker::Broker;
use taskhub_core::types::Job;
use taskhub_core::types::job::random_id;

use crate::registry::Task;

/// When a periodic task fires.
pub trait Schedule: Send + Sync + std::fmt::Debug {
    /// The first fire time strictly after `prev`, or `None` when the
    /// schedule has no further fires.
    fn next_after(&self, prev: DateTime<Utc>) -> Option<DateTime<Utc>>;
}

/// Fire at a fixed interval.
///
/// A zero interval never fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Every(pub Duration);

impl Schedule for Every {
    fn next_after(&self, prev: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.0.is_zero() {
            return None;
        }
        let step = chrono::Duration::from_std(self.0).ok()?;
        prev.checked_add_signed(step)
    }
}

/// Fire according to a cron expression (seconds field optional).
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    cron: Cron,
}

impl CronSchedule {
    /// Parse a cron expression such as `"0 */15 * * * *"` or `"0 3 * * *"`.
    pub fn parse(expression: &str) -> AppResult<Self> {
        let cron = Cron::from_str(expression).map_err(|e| {
            AppError::validation(format!("Invalid cron expression '{expression}': {e}"))
        })?;
        Ok(Self {
            expression: expression.to_string(),
            cron,
        })
    }

    /// The expression this schedule was parsed from.
    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl Schedule for CronSchedule {
    fn next_after(&self, prev: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.cron.find_next_occurrence(&prev, false).ok()
    }
}

/// A task published on a schedule.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    task: Task,
    schedule: Arc<dyn Schedule>,
    unique: bool,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
}

impl ScheduledTask {
    /// Schedule `task` with no arguments.
    ///
    /// Fires use the task id as the job id, so at most one job per task is
    /// tracked as unacked at a time. See [`ScheduledTask::unique`].
    pub fn new(task: Task, schedule: impl Schedule + 'static) -> Self {
        Self {
            task,
            schedule: Arc::new(schedule),
            unique: false,
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    /// Give every fire its own job id.
    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// Arguments passed to every fire.
    pub fn with_args(mut self, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        self.args = args;
        self.kwargs = kwargs;
        self
    }

    /// The scheduled task handle.
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Build the job for one fire.
    pub fn job_for_fire(&self) -> Job {
        let id = if self.unique {
            format!("{}:{}", self.task.id(), random_id())
        } else {
            self.task.id().to_string()
        };
        Job::with_id(
            id,
            self.task.id(),
            self.task.queue(),
            self.args.clone(),
            self.kwargs.clone(),
        )
    }
}

/// Runs one loop per scheduled task.
#[derive(Debug, Default)]
pub struct Scheduler {
    tasks: Vec<ScheduledTask>,
}

impl Scheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a scheduled task
    pub fn add(&mut self, task: ScheduledTask) {
        info!(task = %task.task.id(), unique = task.unique, "Registered scheduled task");
        self.tasks.push(task);
    }

    /// Number of scheduled tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task is scheduled
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Spawn every loop into `set`. They stop when `cancel` fires.
    pub fn spawn_all(
        &self,
        broker: &Arc<dyn Broker>,
        cancel: &CancellationToken,
        set: &mut JoinSet<()>,
    ) {
        for task in &self.tasks {
            set.spawn(run_schedule(
                task.clone(),
                Arc::clone(broker),
                cancel.clone(),
            ));
        }
    }
}

/// Publish `task` at each fire until cancelled or the schedule runs out.
pub async fn run_schedule(task: ScheduledTask, broker: Arc<dyn Broker>, cancel: CancellationToken) {
    let task_id = task.task.id().to_string();
    // Fire times come from the wall clock; sleeps are measured on the tokio
    // clock from this anchor.
    let anchor_wall = Utc::now();
    let anchor = Instant::now();
    let mut prev = anchor_wall;

    debug!(task = %task_id, "Schedule loop started");
    loop {
        let Some(next) = task.schedule.next_after(prev) else {
            info!(task = %task_id, "Schedule has no further fires");
            break;
        };
        let offset = (next - anchor_wall).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(anchor + offset) => {}
        }
        if cancel.is_cancelled() {
            break;
        }

        let job = task.job_for_fire();
        match broker.publish(&job).await {
            Ok(()) => debug!(task = %task_id, job_id = %job.id, "Published scheduled job"),
            Err(e) => {
                let err = AppError::scheduling(format!(
                    "Failed to publish scheduled task '{task_id}': {e}"
                ));
                error!(task = %task_id, error = %err, "Scheduled fire dropped");
            }
        }
        prev = next;
    }
    debug!(task = %task_id, "Schedule loop stopped");
}
