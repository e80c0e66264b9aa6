//! Bounded priority task queue.
//!
//! Min-heap on `(priority, sequence)`: higher priority first, FIFO within a
//! priority. `push` waits for space, `try_push` fails fast, and `requeue`
//! ignores the bound so a worker can always hand a task back.

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::sync::Notify;

use super::types::{Task, TaskPriority};
use crate::types::{Error, Result, TaskId};

#[derive(Debug)]
struct QueueEntry {
    priority: TaskPriority,
    seq: u64,
    task: Task,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // BinaryHeap is a max-heap; reverse so the smallest (priority, seq) pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    heap: BinaryHeap<QueueEntry>,
    next_seq: u64,
}

#[derive(Debug)]
pub struct PriorityTaskQueue {
    capacity: usize,
    inner: Mutex<QueueInner>,
    items: Notify,
    space: Notify,
}

impl PriorityTaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(QueueInner::default()),
            items: Notify::new(),
            space: Notify::new(),
        }
    }

    /// Insert, handing the task back when the bound is hit.
    fn offer(&self, task: Task, bounded: bool) -> std::result::Result<(), Task> {
        {
            let mut inner = self.inner.lock();
            if bounded && inner.heap.len() >= self.capacity {
                return Err(task);
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(QueueEntry {
                priority: task.priority,
                seq,
                task,
            });
        }
        self.items.notify_one();
        Ok(())
    }

    /// Enqueue, waiting while the queue is full.
    pub async fn push(&self, task: Task) {
        let mut task = task;
        loop {
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.offer(task, true) {
                Ok(()) => return,
                Err(back) => task = back,
            }
            notified.await;
        }
    }

    /// Enqueue within the bound, handing the task back when full.
    pub fn offer_bounded(&self, task: Task) -> std::result::Result<(), Task> {
        self.offer(task, true)
    }

    /// Enqueue or fail with `QueueFull`.
    pub fn try_push(&self, task: Task) -> Result<()> {
        self.offer(task, true).map_err(|task| {
            Error::queue_full(format!(
                "task {} rejected, capacity {} reached",
                task.id, self.capacity
            ))
        })
    }

    /// Hand a task back to the queue regardless of the bound.
    pub fn requeue(&self, task: Task) {
        let _ = self.offer(task, false);
    }

    pub fn try_pop(&self) -> Option<Task> {
        let entry = self.inner.lock().heap.pop();
        entry.map(|entry| {
            self.space.notify_one();
            entry.task
        })
    }

    /// Wait for the next task. Cancel-safe: a task is only removed from the
    /// heap when this future resolves.
    pub async fn pop(&self) -> Task {
        loop {
            let notified = self.items.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.try_pop() {
                return task;
            }
            notified.await;
        }
    }

    /// Remove a queued task by id.
    pub fn remove(&self, task_id: &TaskId) -> Option<Task> {
        let removed = {
            let mut inner = self.inner.lock();
            let entries = std::mem::take(&mut inner.heap).into_vec();
            let mut removed = None;
            let mut kept = Vec::with_capacity(entries.len());
            for entry in entries {
                if removed.is_none() && &entry.task.id == task_id {
                    removed = Some(entry.task);
                } else {
                    kept.push(entry);
                }
            }
            inner.heap = BinaryHeap::from(kept);
            removed
        };
        if removed.is_some() {
            self.space.notify_one();
        }
        removed
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.inner.lock().heap.iter().any(|e| &e.task.id == task_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::types::TaskPayload;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn task(priority: TaskPriority) -> Task {
        Task::new(
            "test",
            TaskPayload::from_async(|_ctx| async { Ok(serde_json::Value::Null) }),
        )
        .with_priority(priority)
    }

    #[test]
    fn test_higher_priority_pops_first() {
        let queue = PriorityTaskQueue::new(10);
        let low = task(TaskPriority::Low);
        let critical = task(TaskPriority::Critical);
        let normal = task(TaskPriority::Normal);
        let (low_id, critical_id, normal_id) =
            (low.id.clone(), critical.id.clone(), normal.id.clone());

        queue.try_push(low).unwrap();
        queue.try_push(critical).unwrap();
        queue.try_push(normal).unwrap();

        assert_eq!(queue.try_pop().unwrap().id, critical_id);
        assert_eq!(queue.try_pop().unwrap().id, normal_id);
        assert_eq!(queue.try_pop().unwrap().id, low_id);
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_try_push_full() {
        let queue = PriorityTaskQueue::new(1);
        queue.try_push(task(TaskPriority::Normal)).unwrap();
        let err = queue.try_push(task(TaskPriority::Normal)).unwrap_err();
        assert!(matches!(err, Error::QueueFull(_)));
    }

    #[test]
    fn test_requeue_ignores_capacity() {
        let queue = PriorityTaskQueue::new(1);
        queue.try_push(task(TaskPriority::Normal)).unwrap();
        queue.requeue(task(TaskPriority::High));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop().unwrap().priority, TaskPriority::High);
    }

    #[test]
    fn test_remove_by_id() {
        let queue = PriorityTaskQueue::new(10);
        let a = task(TaskPriority::Normal);
        let b = task(TaskPriority::Normal);
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        queue.try_push(a).unwrap();
        queue.try_push(b).unwrap();

        assert!(queue.remove(&a_id).is_some());
        assert!(queue.remove(&a_id).is_none());
        assert!(!queue.contains(&a_id));
        assert_eq!(queue.try_pop().unwrap().id, b_id);
    }

    #[tokio::test]
    async fn test_push_waits_for_space() {
        let queue = Arc::new(PriorityTaskQueue::new(1));
        queue.try_push(task(TaskPriority::Normal)).unwrap();

        let pusher = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(task(TaskPriority::Low)).await })
        };
        tokio::task::yield_now().await;
        assert!(!pusher.is_finished());

        queue.pop().await;
        tokio::time::timeout(Duration::from_secs(1), pusher)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_pop_waits_for_item() {
        let queue = Arc::new(PriorityTaskQueue::new(4));
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;

        let t = task(TaskPriority::Normal);
        let id = t.id.clone();
        queue.try_push(t).unwrap();
        let popped = tokio::time::timeout(Duration::from_secs(1), popper)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped.id, id);
    }

    #[test]
    fn test_pop_is_woken_by_push() {
        let queue = PriorityTaskQueue::new(4);
        let mut pop = tokio_test::task::spawn(queue.pop());
        tokio_test::assert_pending!(pop.poll());

        queue.try_push(task(TaskPriority::Normal)).unwrap();
        assert!(pop.is_woken());
        let popped = tokio_test::assert_ready!(pop.poll());
        assert_eq!(popped.priority, TaskPriority::Normal);
    }

    fn priority_strategy() -> impl Strategy<Value = TaskPriority> {
        prop_oneof![
            Just(TaskPriority::Critical),
            Just(TaskPriority::High),
            Just(TaskPriority::Normal),
            Just(TaskPriority::Low),
            Just(TaskPriority::Background),
        ]
    }

    proptest! {
        #[test]
        fn prop_pop_order_is_priority_then_fifo(priorities in prop::collection::vec(priority_strategy(), 0..64)) {
            let queue = PriorityTaskQueue::new(priorities.len().max(1));
            let mut expected = Vec::new();
            for (index, priority) in priorities.iter().enumerate() {
                let t = task(*priority);
                expected.push((*priority, index, t.id.clone()));
                queue.try_push(t).unwrap();
            }
            expected.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

            let popped: Vec<TaskId> = std::iter::from_fn(|| queue.try_pop()).map(|t| t.id).collect();
            let expected: Vec<TaskId> = expected.into_iter().map(|(_, _, id)| id).collect();
            prop_assert_eq!(popped, expected);
        }
    }
}
