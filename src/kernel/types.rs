//! Kernel types: TaskPriority, TaskStatus, Task, TaskPayload, TaskResult.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::results::ResultStore;
use crate::types::{Error, Result, TaskId};

/// Scheduling priority. Lower sorts first: `Critical` is served before `Background`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Background,
}

/// Task lifecycle state.
///
/// ```text
/// PENDING (scheduled) → QUEUED → RUNNING → {COMPLETED | FAILED | RETRYING}
///                          ↑                                     │
///                          └─────────────────────────────────────┘
/// QUEUED / PENDING / RUNNING / RETRYING → CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl TaskStatus {
    /// No further transitions will happen.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// What a task function returns.
pub type TaskOutput = Result<serde_json::Value>;

// =============================================================================
// Arguments
// =============================================================================

/// Named arguments handed to a task function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskArgs(serde_json::Map<String, serde_json::Value>);

impl TaskArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an argument (builder style).
    pub fn with<T: Serialize>(mut self, key: impl Into<String>, value: T) -> Result<Self> {
        self.insert(key, value)?;
        Ok(self)
    }

    pub fn insert<T: Serialize>(&mut self, key: impl Into<String>, value: T) -> Result<()> {
        self.0.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Typed lookup. Missing keys are a validation error.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .0
            .get(key)
            .ok_or_else(|| Error::validation(format!("missing task argument: {}", key)))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn get_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.0.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// =============================================================================
// Execution context
// =============================================================================

/// Progress reporting handle for the running task.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    task_id: TaskId,
    results: Arc<ResultStore>,
}

impl ProgressReporter {
    pub(crate) fn new(task_id: TaskId, results: Arc<ResultStore>) -> Self {
        Self { task_id, results }
    }

    /// Record `step` out of `total_steps`, optionally with a log message.
    /// Ignored once the task has settled. Returns whether it was recorded.
    pub fn update(&self, step: u64, total_steps: u64, message: &str) -> bool {
        let percent = (step as f64 / total_steps.max(1) as f64 * 100.0).min(100.0);
        let line = (!message.is_empty()).then(|| format!("{}: {}", Utc::now().to_rfc3339(), message));
        let recorded = self.results.update_if_live(&self.task_id, |r| {
            r.progress = percent;
            if let Some(line) = line {
                r.logs.push(line);
            }
        });
        if recorded {
            tracing::debug!(task_id = %self.task_id, progress = percent, note = message, "task_progress");
        }
        recorded
    }
}

/// Everything a task function sees while it runs.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub task_type: String,
    /// 0 for the first attempt, incremented per retry.
    pub attempt: u32,
    pub args: Arc<TaskArgs>,
    /// Cancelled when the task is cancelled or the pool shuts down.
    pub cancel: CancellationToken,
    pub progress: ProgressReporter,
}

// =============================================================================
// Payload
// =============================================================================

/// Asynchronous task function, run on the worker's own tokio task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, ctx: TaskContext) -> TaskOutput;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = TaskOutput> + Send + 'static,
{
    async fn execute(&self, ctx: TaskContext) -> TaskOutput {
        (self)(ctx).await
    }
}

/// Blocking task function, run on a secondary pool.
pub type BlockingFn = dyn Fn(TaskContext) -> TaskOutput + Send + Sync;

/// Opaque command object supplied by collaborators.
#[derive(Clone)]
pub enum TaskPayload {
    Async(Arc<dyn TaskHandler>),
    Blocking(Arc<BlockingFn>),
}

impl TaskPayload {
    /// Wrap an async closure.
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskOutput> + Send + 'static,
    {
        Self::Async(Arc::new(f))
    }

    /// Wrap a handler object.
    pub fn handler(handler: impl TaskHandler + 'static) -> Self {
        Self::Async(Arc::new(handler))
    }

    /// Wrap a blocking closure. Routed to the compute runtime when the task
    /// type is CPU-intensive, otherwise to the blocking pool.
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(TaskContext) -> TaskOutput + Send + Sync + 'static,
    {
        Self::Blocking(Arc::new(f))
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Blocking(_))
    }
}

impl fmt::Debug for TaskPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Async(_) => f.write_str("TaskPayload::Async"),
            Self::Blocking(_) => f.write_str("TaskPayload::Blocking"),
        }
    }
}

// =============================================================================
// Task
// =============================================================================

/// Immutable task definition plus its payload.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub task_type: String,
    pub priority: TaskPriority,
    pub max_retries: u32,
    /// Base delay; attempt `n` waits `retry_delay * 2^n`.
    pub retry_delay: Duration,
    pub timeout: Option<Duration>,
    pub dependencies: BTreeSet<TaskId>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub payload: TaskPayload,
    pub args: Arc<TaskArgs>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, payload: TaskPayload) -> Self {
        Self {
            id: TaskId::new(),
            task_type: task_type.into(),
            priority: TaskPriority::default(),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            timeout: None,
            dependencies: BTreeSet::new(),
            tags: Vec::new(),
            created_at: Utc::now(),
            scheduled_at: None,
            payload,
            args: Arc::new(TaskArgs::default()),
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_args(mut self, args: TaskArgs) -> Self {
        self.args = Arc::new(args);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_dependency(mut self, id: TaskId) -> Self {
        self.dependencies.insert(id);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Structural checks that do not need the result store.
    pub fn validate(&self) -> Result<()> {
        if self.task_type.trim().is_empty() {
            return Err(Error::validation("task_type cannot be empty"));
        }
        if matches!(self.timeout, Some(t) if t.is_zero()) {
            return Err(Error::validation(format!(
                "task {}: timeout must be non-zero",
                self.id
            )));
        }
        if self.dependencies.contains(&self.id) {
            return Err(Error::validation(format!(
                "task {} cannot depend on itself",
                self.id
            )));
        }
        Ok(())
    }

    /// Fresh instance for a recurring schedule: new id and timestamps, same
    /// payload, arguments and execution policy. Dependencies are not carried.
    pub fn derive_instance(&self) -> Self {
        Self {
            id: TaskId::new(),
            task_type: self.task_type.clone(),
            priority: self.priority,
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
            timeout: self.timeout,
            dependencies: BTreeSet::new(),
            tags: self.tags.clone(),
            created_at: Utc::now(),
            scheduled_at: None,
            payload: self.payload.clone(),
            args: self.args.clone(),
        }
    }
}

/// Options for the `(func, args, priority, timeout?, max_retries?, tags?)`
/// submission form.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub task_type: String,
    pub priority: TaskPriority,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub tags: Vec<String>,
    pub dependencies: Vec<TaskId>,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            task_type: "generic".to_string(),
            priority: TaskPriority::Normal,
            timeout: None,
            max_retries: None,
            retry_delay: None,
            tags: Vec::new(),
            dependencies: Vec::new(),
        }
    }
}

impl SubmitOptions {
    pub fn into_task(self, payload: TaskPayload, args: TaskArgs) -> Task {
        let mut task = Task::new(self.task_type, payload)
            .with_priority(self.priority)
            .with_args(args)
            .with_tags(self.tags);
        task.timeout = self.timeout;
        if let Some(max_retries) = self.max_retries {
            task.max_retries = max_retries;
        }
        if let Some(retry_delay) = self.retry_delay {
            task.retry_delay = retry_delay;
        }
        task.dependencies.extend(self.dependencies);
        task
    }
}

// =============================================================================
// Result
// =============================================================================

/// Mutable execution record, one per submitted task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Seconds.
    pub execution_time: f64,
    /// Percent, 0..=100.
    pub progress: f64,
    pub logs: Vec<String>,
}

impl TaskResult {
    pub fn new(task_id: TaskId, status: TaskStatus) -> Self {
        Self {
            task_id,
            status,
            result: None,
            error: None,
            retry_count: 0,
            started_at: None,
            completed_at: None,
            execution_time: 0.0,
            progress: 0.0,
            logs: Vec::new(),
        }
    }

    /// Transition to RUNNING.
    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
    }

    /// Transition to COMPLETED.
    pub fn complete(&mut self, value: serde_json::Value) {
        self.status = TaskStatus::Completed;
        self.result = Some(value);
        self.error = None;
        self.progress = 100.0;
        self.finish_timing();
    }

    /// Transition to FAILED (terminal).
    pub fn fail(&mut self, error: String) {
        self.status = TaskStatus::Failed;
        self.error = Some(error);
        self.finish_timing();
    }

    /// Record a failed attempt that will be retried.
    pub fn retry(&mut self, error: String) {
        self.status = TaskStatus::Retrying;
        self.error = Some(error);
        self.retry_count += 1;
        self.finish_timing();
    }

    pub fn cancel(&mut self) {
        self.status = TaskStatus::Cancelled;
        if self.started_at.is_some() {
            self.finish_timing();
        } else {
            self.completed_at = Some(Utc::now());
        }
    }

    fn finish_timing(&mut self) {
        let now = Utc::now();
        self.completed_at = Some(now);
        if let Some(started) = self.started_at {
            self.execution_time = (now - started).num_milliseconds() as f64 / 1000.0;
        }
    }
}
