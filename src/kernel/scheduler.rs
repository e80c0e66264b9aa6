//! Delayed and recurring task scheduling.
//!
//! A background loop ticks at a fixed interval and moves due work into the
//! priority queue:
//! - one-shot tasks whose `scheduled_at` has passed
//! - recurring templates whose next execution is due (a fresh instance each time)

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::registry::TaskRegistry;
use super::types::Task;
use crate::types::{Error, Result, SchedulerConfig, TaskId};

/// Instance ids remembered per recurring schedule, newest last.
const RECENT_INSTANCES: usize = 32;

/// A recurring template and its run bookkeeping.
#[derive(Debug)]
struct RecurringEntry {
    template: Task,
    interval: Duration,
    max_executions: Option<u32>,
    execution_count: u32,
    next_execution: Instant,
    instances: VecDeque<TaskId>,
}

/// Read-only view of a recurring schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringInfo {
    pub recurring_id: TaskId,
    pub task_type: String,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub max_executions: Option<u32>,
    pub execution_count: u32,
    /// Ids of the most recent instances, oldest first.
    pub instances: Vec<TaskId>,
}

/// Statistics from one scheduler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickStats {
    pub scheduled_enqueued: usize,
    pub scheduled_deferred: usize,
    pub recurring_enqueued: usize,
    pub recurring_finished: usize,
}

#[derive(Debug)]
pub struct Scheduler {
    config: SchedulerConfig,
    registry: Arc<TaskRegistry>,
    scheduled: Mutex<HashMap<TaskId, Task>>,
    recurring: Mutex<HashMap<TaskId, RecurringEntry>>,
    stop: CancellationToken,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, registry: Arc<TaskRegistry>) -> Self {
        Self {
            config,
            registry,
            scheduled: Mutex::new(HashMap::new()),
            recurring: Mutex::new(HashMap::new()),
            stop: CancellationToken::new(),
        }
    }

    /// Hold `task` until `at`. The task gets a PENDING record immediately.
    pub fn schedule_task(&self, mut task: Task, at: DateTime<Utc>) -> Result<TaskId> {
        task.scheduled_at = Some(at);
        self.registry.register_pending(&task)?;
        let task_id = task.id.clone();
        tracing::info!(task_id = %task_id, scheduled_at = %at, "task_scheduled");
        self.scheduled.lock().insert(task_id.clone(), task);
        Ok(task_id)
    }

    /// Run a fresh instance of `template` every `interval`, at most
    /// `max_executions` times. The first instance is due one interval from now.
    pub fn schedule_recurring_task(
        &self,
        template: Task,
        interval: Duration,
        max_executions: Option<u32>,
    ) -> Result<TaskId> {
        template.validate()?;
        if interval.is_zero() {
            return Err(Error::validation("recurring interval must be non-zero"));
        }
        if max_executions == Some(0) {
            return Err(Error::validation("max_executions must be at least 1"));
        }

        let recurring_id = template.id.clone();
        tracing::info!(
            recurring_id = %recurring_id,
            task_type = %template.task_type,
            interval_ms = interval.as_millis() as u64,
            ?max_executions,
            "recurring_task_scheduled"
        );
        self.recurring.lock().insert(
            recurring_id.clone(),
            RecurringEntry {
                template,
                interval,
                max_executions,
                execution_count: 0,
                next_execution: Instant::now() + interval,
                instances: VecDeque::with_capacity(RECENT_INSTANCES),
            },
        );
        Ok(recurring_id)
    }

    /// Drop a one-shot task that has not been enqueued yet.
    pub fn cancel_scheduled(&self, task_id: &TaskId) -> bool {
        let removed = self.scheduled.lock().remove(task_id).is_some();
        if removed {
            self.registry.cancel_pending(task_id);
            tracing::info!(task_id = %task_id, "scheduled_task_cancelled");
        }
        removed
    }

    /// Stop a recurring schedule. Instances already enqueued keep running.
    pub fn cancel_recurring(&self, recurring_id: &TaskId) -> bool {
        let removed = self.recurring.lock().remove(recurring_id).is_some();
        if removed {
            tracing::info!(recurring_id = %recurring_id, "recurring_task_cancelled");
        }
        removed
    }

    pub fn recurring_info(&self, recurring_id: &TaskId) -> Option<RecurringInfo> {
        self.recurring
            .lock()
            .get(recurring_id)
            .map(|entry| RecurringInfo {
                recurring_id: recurring_id.clone(),
                task_type: entry.template.task_type.clone(),
                interval: entry.interval,
                max_executions: entry.max_executions,
                execution_count: entry.execution_count,
                instances: entry.instances.iter().cloned().collect(),
            })
    }

    pub fn scheduled_count(&self) -> usize {
        self.scheduled.lock().len()
    }

    pub fn recurring_count(&self) -> usize {
        self.recurring.lock().len()
    }

    /// Start the scheduling loop in the background.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(scheduler.config.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(
                tick_ms = scheduler.config.tick_interval.as_millis() as u64,
                "scheduler_started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let stats = scheduler.tick();
                        if stats != TickStats::default() {
                            tracing::debug!(?stats, "scheduler_tick");
                        }
                    }
                    _ = scheduler.stop.cancelled() => {
                        tracing::info!("scheduler_stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the scheduling loop.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Move everything due into the queue.
    pub fn tick(&self) -> TickStats {
        let mut stats = TickStats::default();
        self.enqueue_due_scheduled(Utc::now(), &mut stats);
        self.enqueue_due_recurring(Instant::now(), &mut stats);
        stats
    }

    fn enqueue_due_scheduled(&self, now: DateTime<Utc>, stats: &mut TickStats) {
        let due: Vec<Task> = {
            let mut scheduled = self.scheduled.lock();
            let due_ids: Vec<TaskId> = scheduled
                .iter()
                .filter(|(_, task)| task.scheduled_at.is_some_and(|at| at <= now))
                .map(|(id, _)| id.clone())
                .collect();
            due_ids
                .iter()
                .filter_map(|id| scheduled.remove(id))
                .collect()
        };

        for task in due {
            let task_id = task.id.clone();
            match self.registry.enqueue_pending(task) {
                Ok(()) => {
                    stats.scheduled_enqueued += 1;
                    tracing::debug!(task_id = %task_id, "scheduled_task_enqueued");
                }
                Err((task, Error::QueueFull(_))) => {
                    // Stays pending until a later tick finds room.
                    stats.scheduled_deferred += 1;
                    self.scheduled.lock().insert(task_id, task);
                }
                Err((_, e)) => {
                    tracing::warn!(task_id = %task_id, error = %e, "scheduled_task_dropped");
                }
            }
        }
    }

    fn enqueue_due_recurring(&self, now: Instant, stats: &mut TickStats) {
        let mut recurring = self.recurring.lock();
        let mut finished = Vec::new();

        for (recurring_id, entry) in recurring.iter_mut() {
            if entry.next_execution > now {
                continue;
            }

            let instance = entry.template.derive_instance();
            let instance_id = instance.id.clone();
            match self.registry.try_submit(instance) {
                Ok(_) => {
                    entry.execution_count += 1;
                    entry.next_execution = now + entry.interval;
                    if entry.instances.len() == RECENT_INSTANCES {
                        entry.instances.pop_front();
                    }
                    entry.instances.push_back(instance_id.clone());
                    stats.recurring_enqueued += 1;
                    tracing::debug!(
                        recurring_id = %recurring_id,
                        instance_id = %instance_id,
                        execution_count = entry.execution_count,
                        "recurring_instance_enqueued"
                    );
                }
                Err(e) => {
                    tracing::warn!(recurring_id = %recurring_id, error = %e, "recurring_instance_deferred");
                    continue;
                }
            }

            if entry
                .max_executions
                .is_some_and(|max| entry.execution_count >= max)
            {
                finished.push(recurring_id.clone());
            }
        }

        for recurring_id in finished {
            recurring.remove(&recurring_id);
            stats.recurring_finished += 1;
            tracing::info!(recurring_id = %recurring_id, "recurring_task_finished");
        }
    }
}
