//! Task registry: maps task names to handlers and builds jobs for them.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{info, warn};

use taskhub_core::error::{AppError, ErrorKind};
use taskhub_core::types::Job;
use taskhub_core::types::job::random_id;

/// Trait for task handler implementations
#[async_trait]
pub trait TaskHandler: Send + Sync + std::fmt::Debug {
    /// Run the task for one job
    async fn execute(&self, job: &Job) -> Result<Value, JobExecutionError>;
}

/// Error from job execution. Failed jobs are never retried.
#[derive(Debug, thiserror::Error)]
pub enum JobExecutionError {
    /// The task rejected the job
    #[error("Permanent job failure: {0}")]
    Permanent(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] AppError),
}

impl JobExecutionError {
    /// Shorthand for a permanent failure
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }
}

impl From<JobExecutionError> for AppError {
    fn from(err: JobExecutionError) -> Self {
        match err {
            JobExecutionError::Permanent(message) => AppError::job_execution(message),
            JobExecutionError::Internal(inner) => {
                AppError::with_source(ErrorKind::JobExecution, inner.message.clone(), inner)
            }
        }
    }
}

/// Handle to a registered task, used to build jobs for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    id: String,
    queue: String,
    key: Option<String>,
}

impl Task {
    /// Task name, also the `name` field of every job it builds
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue the task's jobs are published to
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// A copy of this handle whose jobs all carry `key` as their id.
    ///
    /// Publishing again while a job with that id is still unacked
    /// overwrites its unacked record rather than adding a second one.
    pub fn with_key(&self, key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..self.clone()
        }
    }

    /// Build a job with the given arguments
    pub fn with_args(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> Job {
        let id = self.key.clone().unwrap_or_else(random_id);
        Job::with_id(id, &self.id, &self.queue, args, kwargs)
    }

    /// Build a job without arguments
    pub fn job(&self) -> Job {
        self.with_args(Vec::new(), Map::new())
    }
}

/// Wraps a closure taking the whole job
struct FnHandler<F> {
    func: F,
}

impl<F> std::fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, JobExecutionError>> + Send + 'static,
{
    async fn execute(&self, job: &Job) -> Result<Value, JobExecutionError> {
        (self.func)(job.clone()).await
    }
}

/// Wraps a closure taking deserialized arguments
struct TypedHandler<A, F> {
    func: F,
    _args: PhantomData<fn() -> A>,
}

impl<A, F> std::fmt::Debug for TypedHandler<A, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedHandler")
            .field("args", &std::any::type_name::<A>())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<A, R, F, Fut> TaskHandler for TypedHandler<A, F>
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, JobExecutionError>> + Send + 'static,
{
    async fn execute(&self, job: &Job) -> Result<Value, JobExecutionError> {
        let args = decode_args::<A>(job)?;
        let result = (self.func)(args).await?;
        serde_json::to_value(result).map_err(|e| JobExecutionError::Internal(e.into()))
    }
}

/// Decode job arguments: positional args as a sequence, or keyword args as a
/// map when no positional args were given.
fn decode_args<A: DeserializeOwned>(job: &Job) -> Result<A, JobExecutionError> {
    let raw = if job.args.is_empty() && !job.kwargs.is_empty() {
        Value::Object(job.kwargs.clone())
    } else {
        Value::Array(job.args.clone())
    };
    serde_json::from_value(raw).map_err(|e| {
        JobExecutionError::permanent(format!(
            "Invalid arguments for task '{}': {e}",
            job.name
        ))
    })
}

/// Registered tasks by name
#[derive(Debug)]
pub struct TaskRegistry {
    /// Handlers by task id
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    /// Queue for tasks registered through [`TaskRegistry::register_default`]
    default_queue: String,
}

impl TaskRegistry {
    /// Create an empty registry
    pub fn new(default_queue: impl Into<String>) -> Self {
        Self {
            handlers: HashMap::new(),
            default_queue: default_queue.into(),
        }
    }

    /// Queue used when a task does not name one
    pub fn default_queue(&self) -> &str {
        &self.default_queue
    }

    /// Register a handler under `id`, publishing to `queue`
    pub fn register(
        &mut self,
        id: impl Into<String>,
        queue: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Task {
        let id = id.into();
        let queue = queue.into();
        if self.handlers.insert(id.clone(), handler).is_some() {
            warn!(task = %id, "Replaced existing task handler");
        }
        info!(task = %id, queue = %queue, "Registered task");
        Task {
            id,
            queue,
            key: None,
        }
    }

    /// Register a handler on the default queue
    pub fn register_default(&mut self, id: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Task {
        let queue = self.default_queue.clone();
        self.register(id, queue, handler)
    }

    /// Register an async closure receiving the job
    pub fn register_fn<F, Fut>(
        &mut self,
        id: impl Into<String>,
        queue: impl Into<String>,
        func: F,
    ) -> Task
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, JobExecutionError>> + Send + 'static,
    {
        self.register(id, queue, Arc::new(FnHandler { func }))
    }

    /// Register an async closure receiving typed arguments.
    ///
    /// `A` is deserialized from the job's positional args (a tuple or a
    /// struct), or from its keyword args when there are no positional ones.
    /// Arguments that do not fit `A` fail the job.
    pub fn register_typed<A, R, F, Fut>(
        &mut self,
        id: impl Into<String>,
        queue: impl Into<String>,
        func: F,
    ) -> Task
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, JobExecutionError>> + Send + 'static,
    {
        self.register(
            id,
            queue,
            Arc::new(TypedHandler {
                func,
                _args: PhantomData,
            }),
        )
    }

    /// Execute a job by dispatching to its task handler
    pub async fn execute(&self, job: &Job) -> Result<Value, JobExecutionError> {
        let handler = self.handlers.get(&job.name).ok_or_else(|| {
            JobExecutionError::permanent(format!("No task registered with name '{}'", job.name))
        })?;
        handler.execute(job).await
    }

    /// Check if a task is registered
    pub fn has_task(&self, id: &str) -> bool {
        self.handlers.contains_key(id)
    }

    /// Names of all registered tasks, sorted
    pub fn task_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers.keys().cloned().collect();
        ids.sort();
        ids
    }
}
