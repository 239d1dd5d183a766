//! Background worker configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Job worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker name reported in lifecycle events. Generated when empty.
    #[serde(default)]
    pub name: String,
    /// Maximum number of jobs executing at the same time.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Interval in milliseconds between poll loop iterations.
    #[serde(default = "default_poll_rate")]
    pub poll_rate_ms: u64,
    /// Queues to consume, in initial round-robin order.
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,
    /// Seconds to wait for in-flight jobs before cancelling them on shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
    /// Number of recent job reports kept in memory.
    #[serde(default = "default_report_history")]
    pub report_history: usize,
}

impl WorkerConfig {
    /// Poll loop interval.
    pub fn poll_rate(&self) -> Duration {
        Duration::from_millis(self.poll_rate_ms)
    }

    /// Grace period for in-flight jobs during shutdown.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            concurrency: default_concurrency(),
            poll_rate_ms: default_poll_rate(),
            queues: default_queues(),
            shutdown_grace_seconds: default_shutdown_grace(),
            report_history: default_report_history(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_poll_rate() -> u64 {
    500
}

fn default_queues() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_report_history() -> usize {
    1000
}
