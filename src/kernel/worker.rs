//! Worker pool.
//!
//! N long-lived worker loops pull from the shared priority queue. Per task:
//! dependency gate, admission control, execution under timeout and
//! cancellation, then success, retry with exponential backoff, or failure.
//! The record always leaves RUNNING before the task's resource slot is freed.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::executor::ExecutionPools;
use super::registry::{DependencyState, TaskRegistry};
use super::resources::ResourceManager;
use super::types::{ProgressReporter, Task, TaskContext, TaskOutput};
use crate::types::{Error, ResourceConfig, Result, WorkerPoolConfig};

/// Aggregate worker statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerStats {
    pub tasks_processed: u64,
    pub tasks_failed: u64,
    pub tasks_retried: u64,
    pub tasks_cancelled: u64,
    /// Seconds, over successful executions.
    pub total_execution_time: f64,
    pub average_execution_time: f64,
}

impl WorkerStats {
    fn record_success(&mut self, execution_time: f64) {
        self.tasks_processed += 1;
        self.total_execution_time += execution_time;
        self.average_execution_time = self.total_execution_time / self.tasks_processed as f64;
    }
}

/// How one execution attempt ended.
#[derive(Debug)]
enum Outcome {
    Finished(TaskOutput),
    Cancelled,
}

/// Text recorded in `TaskResult::error`.
fn failure_message(error: &Error) -> String {
    match error {
        Error::Timeout(_) => "timeout".to_string(),
        Error::Execution(msg) => msg.clone(),
        other => other.to_string(),
    }
}

/// Delay before retry number `retry_count + 1`: `base * 2^retry_count`.
pub fn retry_backoff(base: Duration, retry_count: u32) -> Duration {
    2u32.checked_pow(retry_count)
        .and_then(|factor| base.checked_mul(factor))
        .unwrap_or(Duration::MAX)
}

/// State shared by all worker loops.
#[derive(Debug)]
struct WorkerShared {
    config: WorkerPoolConfig,
    estimated_memory_mb: u64,
    estimated_cpu_percent: f64,
    registry: Arc<TaskRegistry>,
    resources: Arc<ResourceManager>,
    executor: ExecutionPools,
    stats: parking_lot::Mutex<WorkerStats>,
    cancel: CancellationToken,
}

impl WorkerShared {
    async fn run_loop(self: Arc<Self>, name: String) {
        tracing::debug!(worker = %name, "worker_started");
        loop {
            let task = tokio::select! {
                _ = self.cancel.cancelled() => break,
                task = self.registry.queue().pop() => task,
            };

            if let Err(e) = self.process(task, &name).await {
                tracing::error!(worker = %name, error = %e, "worker_error");
                self.backoff(Duration::from_secs(1)).await;
            }
        }
        tracing::debug!(worker = %name, "worker_stopped");
    }

    /// Sleep unless the pool is shutting down.
    async fn backoff(&self, delay: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    async fn process(&self, task: Task, worker: &str) -> Result<()> {
        let results = self.registry.results();
        let status = results
            .status(&task.id)
            .ok_or_else(|| Error::internal(format!("no result record for task {}", task.id)))?;
        if status.is_terminal() {
            tracing::debug!(task_id = %task.id, ?status, "task_skipped");
            return Ok(());
        }

        match self.registry.dependency_state(&task) {
            DependencyState::Ready => {}
            DependencyState::Waiting => {
                tracing::debug!(task_id = %task.id, "task_waiting_on_dependencies");
                self.registry.park(task);
                return Ok(());
            }
            DependencyState::Failed(dep) => {
                tracing::warn!(task_id = %task.id, dependency = %dep, "task_dependency_failed");
                self.registry.fail(&task.id, "dependency failed");
                self.stats.lock().tasks_failed += 1;
                return Ok(());
            }
        }

        if let Err(e) = self
            .resources
            .admit(self.estimated_memory_mb, self.estimated_cpu_percent)
            .await
        {
            tracing::debug!(task_id = %task.id, reason = %e, "task_deferred_resources");
            self.registry.queue().requeue(task);
            self.backoff(self.config.resource_backoff).await;
            return Ok(());
        }

        let outcome = self.execute(&task, worker).await;
        self.settle(task, outcome, worker);
        self.resources.release().await;
        Ok(())
    }

    /// Move the record out of RUNNING according to how the attempt ended.
    fn settle(&self, task: Task, outcome: Option<Outcome>, worker: &str) {
        let results = self.registry.results();
        match outcome {
            None
            | Some(Outcome::Cancelled)
            | Some(Outcome::Finished(Err(Error::Cancelled(_)))) => {
                self.registry.mark_cancelled(&task.id);
                self.stats.lock().tasks_cancelled += 1;
                tracing::info!(task_id = %task.id, worker, "task_cancelled");
            }
            Some(Outcome::Finished(Ok(value))) => {
                if self.registry.complete(&task.id, value) {
                    let execution_time = results
                        .get(&task.id)
                        .map(|r| r.execution_time)
                        .unwrap_or_default();
                    self.stats.lock().record_success(execution_time);
                    tracing::info!(task_id = %task.id, worker, execution_time, "task_completed");
                } else {
                    self.stats.lock().tasks_cancelled += 1;
                }
            }
            Some(Outcome::Finished(Err(e))) => self.handle_task_retry(task, e),
        }
    }

    /// One attempt. `None` when the task was cancelled before it could start.
    async fn execute(&self, task: &Task, worker: &str) -> Option<Outcome> {
        let token = self
            .registry
            .start(&task.id, self.cancel.child_token())?;
        let attempt = self
            .registry
            .results()
            .get(&task.id)
            .map(|r| r.retry_count)
            .unwrap_or_default();

        tracing::debug!(
            task_id = %task.id,
            task_type = %task.task_type,
            worker,
            attempt,
            lane = ?self.executor.lane_for(task),
            "task_started"
        );

        let ctx = TaskContext {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            attempt,
            args: task.args.clone(),
            cancel: token.clone(),
            progress: ProgressReporter::new(task.id.clone(), self.registry.results().clone()),
        };

        let run = async {
            match task.timeout {
                Some(limit) => tokio::time::timeout(limit, self.executor.run(task, ctx))
                    .await
                    .unwrap_or_else(|_| Err(Error::timeout("timeout"))),
                None => self.executor.run(task, ctx).await,
            }
        };

        Some(tokio::select! {
            _ = token.cancelled() => Outcome::Cancelled,
            output = run => Outcome::Finished(output),
        })
    }

    /// Schedule another attempt after `retry_delay * 2^retry_count`, or settle
    /// as FAILED once `max_retries` is spent. Only timeouts and execution
    /// errors are retried.
    fn handle_task_retry(&self, task: Task, error: Error) {
        let message = failure_message(&error);
        let retry_count = self
            .registry
            .results()
            .get(&task.id)
            .map(|r| r.retry_count)
            .unwrap_or_default();

        if retry_count >= task.max_retries || !error.is_retryable() {
            if self.registry.fail(&task.id, message.clone()) {
                self.stats.lock().tasks_failed += 1;
                tracing::warn!(task_id = %task.id, retry_count, error = %message, "task_failed");
            }
            return;
        }

        let delay = retry_backoff(task.retry_delay, retry_count);
        if self.registry.mark_retrying(&task.id, message.clone()).is_none() {
            return;
        }
        self.stats.lock().tasks_retried += 1;
        tracing::info!(
            task_id = %task.id,
            retry_count = retry_count + 1,
            delay_ms = delay.as_millis() as u64,
            error = %message,
            "task_retry_scheduled"
        );

        let token = self.cancel.child_token();
        self.registry.track(&task.id, token.clone());
        let registry = self.registry.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    registry.mark_cancelled(&task.id);
                }
                _ = tokio::time::sleep(delay) => {
                    registry.requeue_after_retry(task);
                }
            }
        });
    }
}

/// Pool of worker loops plus their execution lanes.
#[derive(Debug)]
pub struct WorkerPool {
    shared: Arc<WorkerShared>,
    handles: AsyncMutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        resource_config: &ResourceConfig,
        registry: Arc<TaskRegistry>,
        resources: Arc<ResourceManager>,
    ) -> Result<Self> {
        let executor = ExecutionPools::new(&config)?;
        Ok(Self {
            shared: Arc::new(WorkerShared {
                config,
                estimated_memory_mb: resource_config.estimated_memory_mb,
                estimated_cpu_percent: resource_config.estimated_cpu_percent,
                registry,
                resources,
                executor,
                stats: parking_lot::Mutex::new(WorkerStats::default()),
                cancel: CancellationToken::new(),
            }),
            handles: AsyncMutex::new(Vec::new()),
        })
    }

    /// Spawn the worker loops. Calling twice is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.shared.cancel.is_cancelled() {
            return Err(Error::internal("worker pool already shut down"));
        }
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return Ok(());
        }
        for i in 0..self.shared.config.workers {
            let shared = self.shared.clone();
            handles.push(tokio::spawn(shared.run_loop(format!("worker-{}", i))));
        }
        tracing::info!(workers = self.shared.config.workers, "worker_pool_started");
        Ok(())
    }

    /// Stop every worker loop and wait for them to exit. Running tasks are
    /// cancelled; blocking payloads already on a thread run to completion
    /// detached.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        self.shared.registry.cancel_all_in_flight();

        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "worker_join_failed");
            }
        }
        self.shared.executor.shutdown();
        tracing::info!("worker_pool_stopped");
    }

    pub async fn active_workers(&self) -> usize {
        self.handles
            .lock()
            .await
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    pub fn worker_count(&self) -> usize {
        self.shared.config.workers
    }

    pub fn stats(&self) -> WorkerStats {
        self.shared.stats.lock().clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}
