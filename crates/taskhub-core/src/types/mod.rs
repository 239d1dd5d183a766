//! Shared data types: jobs, statuses, and local job reports.

pub mod job;
pub mod status;

pub use job::{Job, JobOutcome, JobReport, UnackedEntry};
pub use status::JobStatus;
