//! Built-in tasks available on every worker.

use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, info};

use crate::registry::{JobExecutionError, Task, TaskRegistry};

/// Name of the echo task.
pub const ECHO: &str = "taskhub.echo";
/// Name of the sleep task.
pub const SLEEP: &str = "taskhub.sleep";

/// Handles for the registered built-in tasks.
#[derive(Debug, Clone)]
pub struct BuiltinTasks {
    /// Returns its arguments unchanged.
    pub echo: Task,
    /// Sleeps for the given number of seconds.
    pub sleep: Task,
}

/// Register the built-in tasks on the registry's default queue.
pub fn register(registry: &mut TaskRegistry) -> BuiltinTasks {
    let queue = registry.default_queue().to_string();

    let echo = registry.register_fn(ECHO, queue.clone(), |job| async move {
        debug!(job_id = %job.id, "Echo task invoked");
        Ok::<_, JobExecutionError>(json!({
            "args": job.args,
            "kwargs": job.kwargs,
        }))
    });

    let sleep = registry.register_typed(SLEEP, queue, |(seconds,): (f64,)| async move {
        let duration = Duration::try_from_secs_f64(seconds).map_err(|e| {
            JobExecutionError::permanent(format!("Invalid sleep duration {seconds}: {e}"))
        })?;
        tokio::time::sleep(duration).await;
        info!(seconds, "Sleep task finished");
        Ok::<_, JobExecutionError>(Value::Null)
    });

    BuiltinTasks { echo, sleep }
}
