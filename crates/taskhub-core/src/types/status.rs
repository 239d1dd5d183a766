//! Job status lifecycle.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Local execution status of a job.
///
/// Statuses are tracked by the worker that leased the job and are never
/// written back to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Received but not yet started.
    Pending,
    /// The handler is running.
    InProgress,
    /// The handler returned normally.
    Successful,
    /// The handler failed. Terminal, never retried.
    Failed,
}

impl JobStatus {
    /// Whether the status is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Successful | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Successful => write!(f, "successful"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
