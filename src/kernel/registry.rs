//! Task registry: the queue, the result store, the cancellation handles of
//! tasks currently running or waiting out a retry backoff, and the tasks parked
//! until their dependencies settle.
//!
//! Every path that creates or settles a task goes through here so the queue and
//! the result records never disagree. Parked tasks stay out of the heap, so a
//! dependent never shadows a lower-priority prerequisite.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::queue::PriorityTaskQueue;
use super::results::ResultStore;
use super::types::{Task, TaskResult, TaskStatus};
use crate::types::{Error, Result, TaskId};

/// Where a task's dependencies stand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyState {
    Ready,
    Waiting,
    /// A dependency settled as FAILED or CANCELLED.
    Failed(TaskId),
}

#[derive(Debug)]
pub struct TaskRegistry {
    queue: PriorityTaskQueue,
    results: Arc<ResultStore>,
    in_flight: Mutex<HashMap<TaskId, CancellationToken>>,
    parked: Mutex<HashMap<TaskId, Task>>,
}

impl TaskRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue: PriorityTaskQueue::new(queue_capacity),
            results: Arc::new(ResultStore::new()),
            in_flight: Mutex::new(HashMap::new()),
            parked: Mutex::new(HashMap::new()),
        }
    }

    pub fn queue(&self) -> &PriorityTaskQueue {
        &self.queue
    }

    pub fn results(&self) -> &Arc<ResultStore> {
        &self.results
    }

    /// Structural validation plus dependency existence.
    pub fn validate(&self, task: &Task) -> Result<()> {
        task.validate()?;
        if self.results.contains(&task.id) {
            return Err(Error::validation(format!("duplicate task id {}", task.id)));
        }
        if let Some(missing) = task
            .dependencies
            .iter()
            .find(|dep| !self.results.contains(dep))
        {
            return Err(Error::validation(format!(
                "task {} depends on unknown task {}",
                task.id, missing
            )));
        }
        Ok(())
    }

    /// Validate, record as QUEUED and enqueue, waiting for queue space.
    pub async fn submit(&self, task: Task) -> Result<TaskId> {
        self.validate(&task)?;
        let task_id = task.id.clone();
        self.results
            .insert(TaskResult::new(task_id.clone(), TaskStatus::Queued));
        tracing::debug!(task_id = %task_id, task_type = %task.task_type, priority = ?task.priority, "task_submitted");
        self.queue.push(task).await;
        Ok(task_id)
    }

    /// Validate, record as QUEUED and enqueue, failing with `QueueFull`.
    pub fn try_submit(&self, task: Task) -> Result<TaskId> {
        self.validate(&task)?;
        let task_id = task.id.clone();
        self.results
            .insert(TaskResult::new(task_id.clone(), TaskStatus::Queued));
        if let Err(e) = self.queue.try_push(task) {
            self.results.remove(&task_id);
            return Err(e);
        }
        tracing::debug!(task_id = %task_id, "task_submitted");
        Ok(task_id)
    }

    /// Record a task that will be enqueued later by the scheduler.
    pub fn register_pending(&self, task: &Task) -> Result<()> {
        self.validate(task)?;
        self.results
            .insert(TaskResult::new(task.id.clone(), TaskStatus::Pending));
        Ok(())
    }

    /// Move a PENDING task into the queue. On `QueueFull` the task is handed
    /// back so the caller can retry later.
    pub fn enqueue_pending(&self, task: Task) -> std::result::Result<(), (Task, Error)> {
        if self.results.status(&task.id) != Some(TaskStatus::Pending) {
            return Err((
                task,
                Error::not_found("scheduled task is no longer pending"),
            ));
        }
        let task_id = task.id.clone();
        // Flip first so a worker popping immediately sees QUEUED.
        self.results.update(&task_id, |r| r.status = TaskStatus::Queued);
        match self.queue.offer_bounded(task) {
            Ok(()) => Ok(()),
            Err(task) => {
                self.results
                    .update(&task_id, |r| r.status = TaskStatus::Pending);
                Err((task, Error::queue_full(format!("task {} deferred", task_id))))
            }
        }
    }

    /// Dependency readiness, read from the result store.
    pub fn dependency_state(&self, task: &Task) -> DependencyState {
        let mut waiting = false;
        for dep in &task.dependencies {
            match self.results.status(dep) {
                Some(TaskStatus::Completed) => {}
                Some(TaskStatus::Failed) | Some(TaskStatus::Cancelled) | None => {
                    return DependencyState::Failed(dep.clone());
                }
                Some(_) => waiting = true,
            }
        }
        if waiting {
            DependencyState::Waiting
        } else {
            DependencyState::Ready
        }
    }

    /// Hold a task out of the queue until its dependencies settle. Requeued at
    /// once if they settled since the caller looked.
    pub fn park(&self, task: Task) {
        let mut parked = self.parked.lock();
        if self.dependency_state(&task) == DependencyState::Waiting {
            tracing::debug!(task_id = %task.id, "task_parked");
            parked.insert(task.id.clone(), task);
        } else {
            self.queue.requeue(task);
        }
    }

    pub fn parked_count(&self) -> usize {
        self.parked.lock().len()
    }

    /// Requeue parked tasks whose dependencies are no longer pending. Runs
    /// after every terminal transition; the worker sorts out ready from failed.
    fn release_parked(&self) {
        let mut parked = self.parked.lock();
        if parked.is_empty() {
            return;
        }
        let ready: Vec<TaskId> = parked
            .values()
            .filter(|task| self.dependency_state(task) != DependencyState::Waiting)
            .map(|task| task.id.clone())
            .collect();
        for id in ready {
            if let Some(task) = parked.remove(&id) {
                tracing::debug!(task_id = %id, "task_unparked");
                self.queue.requeue(task);
            }
        }
    }

    /// Transition to RUNNING and hand out the attempt's cancellation token.
    /// Returns `None` when the task was cancelled in the meantime.
    pub fn start(&self, task_id: &TaskId, token: CancellationToken) -> Option<CancellationToken> {
        let mut in_flight = self.in_flight.lock();
        let started = self.results.update_if_live(task_id, |r| r.start());
        if !started {
            return None;
        }
        in_flight.insert(task_id.clone(), token.clone());
        Some(token)
    }

    /// Track a task waiting out a retry backoff so it can be cancelled.
    pub fn track(&self, task_id: &TaskId, token: CancellationToken) {
        self.in_flight.lock().insert(task_id.clone(), token);
    }

    pub fn untrack(&self, task_id: &TaskId) {
        self.in_flight.lock().remove(task_id);
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn complete(&self, task_id: &TaskId, value: serde_json::Value) -> bool {
        self.untrack(task_id);
        let settled = self.results.update_if_live(task_id, |r| r.complete(value));
        self.release_parked();
        settled
    }

    pub fn fail(&self, task_id: &TaskId, error: impl Into<String>) -> bool {
        self.untrack(task_id);
        let error = error.into();
        let settled = self.results.update_if_live(task_id, |r| r.fail(error));
        self.release_parked();
        settled
    }

    /// Record a failed attempt that will be retried. Returns the new retry count.
    pub fn mark_retrying(&self, task_id: &TaskId, error: impl Into<String>) -> Option<u32> {
        let error = error.into();
        let mut retry_count = None;
        self.results.update_if_live(task_id, |r| {
            r.retry(error);
            retry_count = Some(r.retry_count);
        });
        retry_count
    }

    /// Put a task whose backoff elapsed back into the queue.
    pub fn requeue_after_retry(&self, task: Task) -> bool {
        self.untrack(&task.id);
        let requeued = self.results.update_if_live(&task.id, |r| {
            if r.status == TaskStatus::Retrying {
                r.status = TaskStatus::Queued;
            }
        });
        if requeued {
            self.queue.requeue(task);
        }
        requeued
    }

    /// Cancel a queued, parked, running or retrying task. Cooperative for
    /// running tasks: the token fires and the record flips to CANCELLED at once.
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        let cancelled = self.cancel_live(task_id);
        if cancelled {
            self.release_parked();
        }
        cancelled
    }

    fn cancel_live(&self, task_id: &TaskId) -> bool {
        let dequeued = self.queue.remove(task_id).is_some()
            || self.parked.lock().remove(task_id).is_some();
        if dequeued {
            self.results.update_if_live(task_id, |r| r.cancel());
            tracing::info!(task_id = %task_id, "task_cancelled_queued");
            return true;
        }

        let token = self.in_flight.lock().remove(task_id);
        if let Some(token) = token {
            token.cancel();
            self.results.update_if_live(task_id, |r| r.cancel());
            tracing::info!(task_id = %task_id, "task_cancelled_in_flight");
            return true;
        }

        // PENDING records belong to the scheduler; QUEUED records not yet in
        // the heap are mid-push.
        match self.results.status(task_id) {
            Some(TaskStatus::Queued) => self.results.update_if_live(task_id, |r| r.cancel()),
            _ => false,
        }
    }

    /// Settle a scheduled task that never reached the queue.
    pub fn cancel_pending(&self, task_id: &TaskId) -> bool {
        let mut cancelled = false;
        self.results.update(task_id, |r| {
            if r.status == TaskStatus::Pending {
                r.cancel();
                cancelled = true;
            }
        });
        if cancelled {
            self.release_parked();
        }
        cancelled
    }

    /// Settle a task whose attempt observed cancellation. No-op when the
    /// record is already terminal.
    pub fn mark_cancelled(&self, task_id: &TaskId) -> bool {
        self.untrack(task_id);
        let settled = self.results.update_if_live(task_id, |r| r.cancel());
        self.release_parked();
        settled
    }

    /// Cancel every in-flight token (shutdown).
    pub fn cancel_all_in_flight(&self) {
        for (_, token) in self.in_flight.lock().drain() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::types::TaskPayload;

    fn task() -> Task {
        Task::new(
            "test",
            TaskPayload::from_async(|_ctx| async { Ok(serde_json::Value::Null) }),
        )
    }

    #[test]
    fn test_try_submit_records_queued() {
        let registry = TaskRegistry::new(4);
        let id = registry.try_submit(task()).unwrap();
        assert_eq!(registry.results().status(&id), Some(TaskStatus::Queued));
        assert_eq!(registry.queue().len(), 1);
    }

    #[test]
    fn test_try_submit_full_leaves_no_record() {
        let registry = TaskRegistry::new(1);
        registry.try_submit(task()).unwrap();
        let t = task();
        let id = t.id.clone();
        assert!(matches!(registry.try_submit(t), Err(Error::QueueFull(_))));
        assert!(!registry.results().contains(&id));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let registry = TaskRegistry::new(4);
        let err = registry
            .try_submit(task().with_dependency(TaskId::new()))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_dependency_state() {
        let registry = TaskRegistry::new(4);
        let dep = registry.try_submit(task()).unwrap();
        let dependent = task().with_dependency(dep.clone());

        assert_eq!(registry.dependency_state(&dependent), DependencyState::Waiting);
        registry.complete(&dep, serde_json::Value::Null);
        assert_eq!(registry.dependency_state(&dependent), DependencyState::Ready);

        let failed = registry.try_submit(task()).unwrap();
        registry.fail(&failed, "boom");
        let blocked = task().with_dependency(failed.clone());
        assert_eq!(
            registry.dependency_state(&blocked),
            DependencyState::Failed(failed)
        );
    }

    #[test]
    fn test_cancel_queued_removes_from_queue() {
        let registry = TaskRegistry::new(4);
        let id = registry.try_submit(task()).unwrap();
        assert!(registry.cancel(&id));
        assert!(registry.queue().is_empty());
        assert_eq!(registry.results().status(&id), Some(TaskStatus::Cancelled));
        assert!(!registry.cancel(&id));
    }

    #[test]
    fn test_cancel_running_fires_token() {
        let registry = TaskRegistry::new(4);
        let id = registry.try_submit(task()).unwrap();
        let popped = registry.queue().try_pop().unwrap();
        let token = registry.start(&popped.id, CancellationToken::new()).unwrap();

        assert!(registry.cancel(&id));
        assert!(token.is_cancelled());
        assert_eq!(registry.results().status(&id), Some(TaskStatus::Cancelled));
        // A late completion must not overwrite the cancellation.
        assert!(!registry.complete(&id, serde_json::json!(1)));
    }

    #[test]
    fn test_requeue_after_retry_skips_cancelled() {
        let registry = TaskRegistry::new(4);
        let id = registry.try_submit(task()).unwrap();
        let popped = registry.queue().try_pop().unwrap();
        registry.start(&id, CancellationToken::new());
        assert_eq!(registry.mark_retrying(&id, "boom"), Some(1));

        registry.results().update(&id, |r| r.cancel());
        assert!(!registry.requeue_after_retry(popped));
        assert!(registry.queue().is_empty());
    }

    #[test]
    fn test_parked_task_released_when_dependency_settles() {
        let registry = TaskRegistry::new(4);
        let dep = registry.try_submit(task()).unwrap();
        let dependent_id = registry
            .try_submit(task().with_dependency(dep.clone()))
            .unwrap();
        let _dep_task = registry.queue().try_pop().unwrap();
        let dependent = registry.queue().try_pop().unwrap();
        assert_eq!(dependent.id, dependent_id);

        registry.park(dependent);
        assert_eq!(registry.parked_count(), 1);
        assert!(registry.queue().is_empty());

        registry.complete(&dep, serde_json::Value::Null);
        assert_eq!(registry.parked_count(), 0);
        assert!(registry.queue().contains(&dependent_id));
    }

    #[test]
    fn test_park_requeues_when_already_ready() {
        let registry = TaskRegistry::new(4);
        let dep = registry.try_submit(task()).unwrap();
        registry.queue().try_pop();
        registry.complete(&dep, serde_json::Value::Null);

        let dependent = task().with_dependency(dep);
        let id = dependent.id.clone();
        registry.park(dependent);
        assert_eq!(registry.parked_count(), 0);
        assert!(registry.queue().contains(&id));
    }

    #[test]
    fn test_cancel_parked_task() {
        let registry = TaskRegistry::new(4);
        let dep = registry.try_submit(task()).unwrap();
        let id = registry.try_submit(task().with_dependency(dep)).unwrap();
        let dependent = registry.queue().remove(&id).unwrap();
        registry.park(dependent);

        assert!(registry.cancel(&id));
        assert_eq!(registry.parked_count(), 0);
        assert_eq!(registry.results().status(&id), Some(TaskStatus::Cancelled));
    }

    #[test]
    fn test_enqueue_pending() {
        let registry = TaskRegistry::new(1);
        let scheduled = task();
        registry.register_pending(&scheduled).unwrap();
        let id = scheduled.id.clone();
        assert_eq!(registry.results().status(&id), Some(TaskStatus::Pending));

        registry.try_submit(task()).unwrap();
        let (scheduled, err) = registry.enqueue_pending(scheduled).unwrap_err();
        assert!(matches!(err, Error::QueueFull(_)));
        assert_eq!(registry.results().status(&id), Some(TaskStatus::Pending));

        registry.queue().try_pop();
        registry.enqueue_pending(scheduled).unwrap();
        assert_eq!(registry.results().status(&id), Some(TaskStatus::Queued));
    }
}
