//! The job model carried between producers and consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::AppError;
use crate::result::AppResult;
use crate::types::status::JobStatus;

/// One dispatched unit of work.
///
/// A job is immutable once published. Only serializable argument data is
/// carried; the handler is looked up by `name` on the consuming side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique id among concurrently unacked jobs.
    pub id: String,
    /// Name of the registered task that executes this job.
    pub name: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    /// Queue the job is published to.
    pub queue: String,
}

impl Job {
    /// Create a job with a fresh random id.
    pub fn new(
        name: impl Into<String>,
        queue: impl Into<String>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Self {
        Self::with_id(random_id(), name, queue, args, kwargs)
    }

    /// Create a job with a caller-chosen id.
    pub fn with_id(
        id: impl Into<String>,
        name: impl Into<String>,
        queue: impl Into<String>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
            kwargs,
            queue: queue.into(),
        }
    }

    /// Check the fields the broker relies on.
    pub fn validate(&self) -> AppResult<()> {
        if self.id.is_empty() {
            return Err(AppError::validation("Job id must not be empty"));
        }
        if self.queue.is_empty() {
            return Err(AppError::validation(format!(
                "Job '{}' has an empty queue name",
                self.id
            )));
        }
        Ok(())
    }

    /// Encode the job for storage in a queue list.
    pub fn encode(&self) -> AppResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a job previously produced by [`Job::encode`].
    pub fn decode(payload: &str) -> AppResult<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Random job id: a UUID v4 in simple (hyphenless) form.
pub fn random_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Value stored in the unacked hash: the job plus the queue it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnackedEntry {
    /// Queue the job is redelivered to.
    pub queue: String,
    /// The job as published.
    pub job: Job,
}

impl UnackedEntry {
    /// Build the entry for a job.
    pub fn for_job(job: &Job) -> Self {
        Self {
            queue: job.queue.clone(),
            job: job.clone(),
        }
    }

    /// Encode for the unacked hash.
    pub fn encode(&self) -> AppResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode an unacked hash value.
    pub fn decode(raw: &str) -> AppResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Result of running a job's handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum JobOutcome {
    /// The handler returned this value.
    Successful(Value),
    /// The handler failed with this message.
    Failed(String),
}

impl JobOutcome {
    /// The status this outcome maps to.
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Successful(_) => JobStatus::Successful,
            Self::Failed(_) => JobStatus::Failed,
        }
    }
}

/// Local execution record for a job. Never persisted to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    /// Id of the job.
    pub job_id: String,
    /// Task name.
    pub name: String,
    /// Queue the job came from.
    pub queue: String,
    /// Current status.
    pub status: JobStatus,
    /// When the handler was invoked.
    pub time_started: Option<DateTime<Utc>>,
    /// When the handler finished.
    pub time_completed: Option<DateTime<Utc>>,
    /// Handler result once finished.
    pub outcome: Option<JobOutcome>,
}

impl JobReport {
    /// A fresh report for a job that has just been received.
    pub fn pending(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            name: job.name.clone(),
            queue: job.queue.clone(),
            status: JobStatus::Pending,
            time_started: None,
            time_completed: None,
            outcome: None,
        }
    }
}
