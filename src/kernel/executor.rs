//! Execution pools for task payloads.
//!
//! Async payloads run on the worker's own tokio task. Blocking payloads go to
//! one of two secondary pools:
//! - CPU-intensive task types run on a dedicated compute runtime
//! - everything else runs on tokio's blocking pool, bounded by a semaphore

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::Semaphore;

use super::recovery::{with_recovery, with_recovery_async};
use super::types::{BlockingFn, Task, TaskContext, TaskOutput, TaskPayload};
use crate::types::{Error, WorkerPoolConfig};

/// Which pool a payload ran on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionLane {
    Async,
    Blocking,
    Compute,
}

#[derive(Debug)]
pub struct ExecutionPools {
    blocking: Arc<Semaphore>,
    blocking_threads: usize,
    compute: Mutex<Option<Runtime>>,
    cpu_intensive_types: HashSet<String>,
}

impl ExecutionPools {
    pub fn new(config: &WorkerPoolConfig) -> crate::types::Result<Self> {
        let compute = Builder::new_multi_thread()
            .worker_threads(config.compute_threads.max(1))
            .thread_name("gavat-compute")
            .enable_all()
            .build()
            .map_err(|e| Error::internal(format!("failed to create compute runtime: {}", e)))?;

        Ok(Self {
            blocking: Arc::new(Semaphore::new(config.blocking_threads.max(1))),
            blocking_threads: config.blocking_threads.max(1),
            compute: Mutex::new(Some(compute)),
            cpu_intensive_types: config.cpu_intensive_types.iter().cloned().collect(),
        })
    }

    pub fn lane_for(&self, task: &Task) -> ExecutionLane {
        match task.payload {
            TaskPayload::Async(_) => ExecutionLane::Async,
            TaskPayload::Blocking(_) if self.cpu_intensive_types.contains(&task.task_type) => {
                ExecutionLane::Compute
            }
            TaskPayload::Blocking(_) => ExecutionLane::Blocking,
        }
    }

    /// Run the task's payload to completion on the appropriate lane.
    pub async fn run(&self, task: &Task, ctx: TaskContext) -> TaskOutput {
        let name = task.task_type.clone();
        match &task.payload {
            TaskPayload::Async(handler) => {
                let handler = handler.clone();
                with_recovery_async(move || async move { handler.execute(ctx).await }, &name).await
            }
            TaskPayload::Blocking(f) => match self.lane_for(task) {
                ExecutionLane::Compute => self.run_compute(f.clone(), ctx, name).await,
                _ => self.run_blocking(f.clone(), ctx, name).await,
            },
        }
    }

    async fn run_blocking(&self, f: Arc<BlockingFn>, ctx: TaskContext, name: String) -> TaskOutput {
        let permit = self
            .blocking
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::cancelled("blocking pool closed"))?;

        // The permit moves into the closure so the bound holds even if the
        // worker stops waiting (timeout or cancellation).
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            with_recovery(|| f(ctx), &name)
        })
        .await
        .map_err(|e| Error::internal(format!("blocking task join failed: {}", e)))?
    }

    async fn run_compute(&self, f: Arc<BlockingFn>, ctx: TaskContext, name: String) -> TaskOutput {
        let handle = self
            .compute_handle()
            .ok_or_else(|| Error::cancelled("compute runtime shut down"))?;

        handle
            .spawn(async move { with_recovery(|| f(ctx), &name) })
            .await
            .map_err(|e| {
                if e.is_cancelled() {
                    Error::cancelled("compute runtime shut down")
                } else {
                    Error::internal(format!("compute task join failed: {}", e))
                }
            })?
    }

    fn compute_handle(&self) -> Option<Handle> {
        self.compute.lock().as_ref().map(|rt| rt.handle().clone())
    }

    /// Blocking permits currently in use.
    pub fn blocking_in_use(&self) -> usize {
        self.blocking_threads - self.blocking.available_permits()
    }

    /// Stop the compute runtime without waiting for in-flight payloads.
    pub fn shutdown(&self) {
        if let Some(runtime) = self.compute.lock().take() {
            runtime.shutdown_background();
            tracing::debug!("compute_runtime_stopped");
        }
        self.blocking.close();
    }
}

impl Drop for ExecutionPools {
    fn drop(&mut self) {
        // A runtime must not be dropped from inside an async context.
        if let Some(runtime) = self.compute.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}
