//! Task result store.
//!
//! One `TaskResult` per submitted task. Every mutation wakes waiters so
//! `wait_for_terminal` can block until a task settles.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Notify;

use super::types::{TaskResult, TaskStatus};
use crate::types::TaskId;

/// Task counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub retrying: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending
            + self.queued
            + self.running
            + self.completed
            + self.failed
            + self.cancelled
            + self.retrying
    }
}

#[derive(Debug, Default)]
pub struct ResultStore {
    results: RwLock<HashMap<TaskId, TaskResult>>,
    changed: Notify,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, result: TaskResult) {
        self.results.write().insert(result.task_id.clone(), result);
        self.changed.notify_waiters();
    }

    pub fn remove(&self, task_id: &TaskId) -> Option<TaskResult> {
        let removed = self.results.write().remove(task_id);
        self.changed.notify_waiters();
        removed
    }

    /// Apply `f` to the record. Returns false for unknown ids.
    pub fn update<F>(&self, task_id: &TaskId, f: F) -> bool
    where
        F: FnOnce(&mut TaskResult),
    {
        let updated = match self.results.write().get_mut(task_id) {
            Some(result) => {
                f(result);
                true
            }
            None => false,
        };
        if updated {
            self.changed.notify_waiters();
        }
        updated
    }

    /// Apply `f` only while the record is not terminal.
    /// Returns false when the record is missing or already settled.
    pub fn update_if_live<F>(&self, task_id: &TaskId, f: F) -> bool
    where
        F: FnOnce(&mut TaskResult),
    {
        let updated = match self.results.write().get_mut(task_id) {
            Some(result) if !result.status.is_terminal() => {
                f(result);
                true
            }
            _ => false,
        };
        if updated {
            self.changed.notify_waiters();
        }
        updated
    }

    pub fn get(&self, task_id: &TaskId) -> Option<TaskResult> {
        self.results.read().get(task_id).cloned()
    }

    pub fn status(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.results.read().get(task_id).map(|r| r.status)
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.results.read().contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.results.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.read().is_empty()
    }

    /// Wait until the task reaches a terminal status.
    ///
    /// Returns `None` for unknown ids or when `timeout` elapses first.
    pub async fn wait_for_terminal(
        &self,
        task_id: &TaskId,
        timeout: Option<Duration>,
    ) -> Option<TaskResult> {
        let wait = async {
            loop {
                let notified = self.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                match self.get(task_id) {
                    Some(result) if result.status.is_terminal() => return Some(result),
                    None => return None,
                    Some(_) => {}
                }
                notified.await;
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.ok().flatten(),
            None => wait.await,
        }
    }

    pub fn counts(&self) -> StatusCounts {
        let results = self.results.read();
        let mut counts = StatusCounts::default();
        for result in results.values() {
            match result.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Queued => counts.queued += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
                TaskStatus::Retrying => counts.retrying += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_update_unknown_returns_false() {
        let store = ResultStore::new();
        assert!(!store.update(&TaskId::new(), |r| r.progress = 50.0));
    }

    #[test]
    fn test_update_if_live_skips_terminal() {
        let store = ResultStore::new();
        let id = TaskId::new();
        store.insert(TaskResult::new(id.clone(), TaskStatus::Running));
        store.update(&id, |r| r.cancel());

        assert!(!store.update_if_live(&id, |r| r.complete(serde_json::json!(1))));
        assert_eq!(store.status(&id), Some(TaskStatus::Cancelled));
    }

    #[test]
    fn test_counts() {
        let store = ResultStore::new();
        store.insert(TaskResult::new(TaskId::new(), TaskStatus::Queued));
        store.insert(TaskResult::new(TaskId::new(), TaskStatus::Queued));
        store.insert(TaskResult::new(TaskId::new(), TaskStatus::Failed));

        let counts = store.counts();
        assert_eq!(counts.queued, 2);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.total(), 3);
    }

    #[tokio::test]
    async fn test_wait_unknown_returns_none() {
        let store = ResultStore::new();
        assert!(store.wait_for_terminal(&TaskId::new(), None).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_on_live_task() {
        let store = ResultStore::new();
        let id = TaskId::new();
        store.insert(TaskResult::new(id.clone(), TaskStatus::Running));

        let result = store
            .wait_for_terminal(&id, Some(Duration::from_secs(2)))
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_wait_wakes_on_completion() {
        let store = Arc::new(ResultStore::new());
        let id = TaskId::new();
        store.insert(TaskResult::new(id.clone(), TaskStatus::Running));

        let waiter = {
            let store = store.clone();
            let id = id.clone();
            tokio::spawn(async move { store.wait_for_terminal(&id, None).await })
        };
        tokio::task::yield_now().await;
        store.update(&id, |r| r.complete(serde_json::json!("done")));

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.result, Some(serde_json::json!("done")));
    }
}
