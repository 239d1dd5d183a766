//! Job execution and scheduled tasks for TaskHub.
//!
//! This crate provides:
//! - A task registry that maps task names to typed handlers
//! - A worker that consumes jobs from a broker with bounded concurrency
//! - A scheduler that publishes periodic tasks
//! - Built-in tasks for smoke testing a deployment

pub mod builtin;
pub mod registry;
pub mod runner;
pub mod scheduler;

pub use registry::{JobExecutionError, Task, TaskHandler, TaskRegistry};
pub use runner::{Worker, WorkerState};
pub use scheduler::{CronSchedule, Every, Schedule, ScheduledTask, Scheduler};
