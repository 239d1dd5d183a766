//! Worker lifecycle and job status events.

use serde::{Deserialize, Serialize};

use crate::types::status::JobStatus;

/// Events a worker exposes to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// The worker finished starting and is about to poll.
    WorkerStart {
        /// Worker name.
        worker_name: String,
    },
    /// The worker finished draining.
    WorkerShutdown {
        /// Worker name.
        worker_name: String,
    },
    /// A job moved between statuses.
    JobStatusChange {
        /// Job id.
        job_id: String,
        /// Previous status.
        old_status: JobStatus,
        /// New status.
        new_status: JobStatus,
    },
}
