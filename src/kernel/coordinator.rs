//! Coordinator: the single entry point collaborators talk to.
//!
//! Owns the task registry, scheduler and worker pool, plus the traffic
//! shaping pieces (rate limiter, circuit breakers, load balancer). Construct
//! once and share behind an `Arc`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::circuit_breaker::{CircuitBreakerRegistry, CircuitBreakerSnapshot};
use super::load_balancer::{LoadBalancer, LoadBalancerStats, ServiceEndpoint};
use super::rate_limiter::RateLimiter;
use super::registry::TaskRegistry;
use super::resources::{ResourceManager, ResourceStatus};
use super::scheduler::{RecurringInfo, Scheduler};
use super::types::{SubmitOptions, Task, TaskArgs, TaskPayload, TaskResult};
use super::worker::{WorkerPool, WorkerStats};
use crate::types::{Config, EndpointId, Error, Result, TaskId};

/// Aggregate metrics for `execute_with_protections`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtectionMetrics {
    pub requests_processed: u64,
    pub errors_count: u64,
    pub rate_limited_count: u64,
    /// Seconds, running mean over successful calls.
    pub average_response_time: f64,
}

impl ProtectionMetrics {
    fn record_success(&mut self, elapsed: Duration) {
        self.requests_processed += 1;
        let n = self.requests_processed as f64;
        self.average_response_time += (elapsed.as_secs_f64() - self.average_response_time) / n;
    }
}

/// Task execution overview.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerStatus {
    pub running: bool,
    pub workers: usize,
    pub active_workers: usize,
    /// Tasks currently in the priority queue.
    pub queued: usize,
    /// Tasks currently RUNNING.
    pub active: usize,
    pub pending: usize,
    pub retrying: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total_tasks: usize,
    pub scheduled: usize,
    pub recurring: usize,
    pub worker_stats: WorkerStats,
    pub resource_status: ResourceStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterStatus {
    pub available_tokens: f64,
    pub max_tokens: f64,
    pub refill_rate: f64,
}

/// Everything: tasks plus traffic shaping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub manager: ManagerStatus,
    pub load_balancer: LoadBalancerStats,
    pub endpoints: Vec<ServiceEndpoint>,
    pub circuit_breakers: Vec<CircuitBreakerSnapshot>,
    pub rate_limiter: RateLimiterStatus,
    pub protection: ProtectionMetrics,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Coordinator {
    config: Config,
    registry: Arc<TaskRegistry>,
    scheduler: Arc<Scheduler>,
    workers: WorkerPool,
    resources: Arc<ResourceManager>,
    rate_limiter: RateLimiter,
    circuit_breakers: CircuitBreakerRegistry,
    load_balancer: LoadBalancer,
    metrics: Mutex<ProtectionMetrics>,
    running: AtomicBool,
    scheduler_handle: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Validate the config and build every component. Nothing runs until
    /// [`Coordinator::start`].
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(TaskRegistry::new(config.workers.queue_capacity));
        let resources = Arc::new(ResourceManager::new(config.resources.clone()));
        let workers = WorkerPool::new(
            config.workers.clone(),
            &config.resources,
            registry.clone(),
            resources.clone(),
        )?;
        let scheduler = Arc::new(Scheduler::new(config.scheduler.clone(), registry.clone()));

        Ok(Self {
            rate_limiter: RateLimiter::new(config.rate_limit.clone()),
            circuit_breakers: CircuitBreakerRegistry::new(config.circuit_breaker.clone()),
            load_balancer: LoadBalancer::new(config.load_balancer.strategy),
            metrics: Mutex::new(ProtectionMetrics::default()),
            running: AtomicBool::new(false),
            scheduler_handle: AsyncMutex::new(None),
            registry,
            scheduler,
            workers,
            resources,
            config,
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Register configured endpoints, start the worker loops and the
    /// scheduler. Calling twice is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for endpoint in &self.config.load_balancer.endpoints {
            let endpoint = ServiceEndpoint::from_config(endpoint)?;
            if self.load_balancer.get(&endpoint.id).await.is_none() {
                self.load_balancer.add_endpoint(endpoint).await?;
            }
        }

        if let Err(e) = self.workers.start().await {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        *self.scheduler_handle.lock().await = Some(self.scheduler.start());

        tracing::info!(
            workers = self.workers.worker_count(),
            queue_capacity = self.config.workers.queue_capacity,
            max_concurrent_tasks = self.resources.max_concurrent_tasks(),
            strategy = ?self.load_balancer.strategy(),
            "coordinator_started"
        );
        Ok(())
    }

    /// Stop the scheduler, cancel and join the workers, stop the compute
    /// runtime.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.scheduler.stop();
        if let Some(handle) = self.scheduler_handle.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "scheduler_join_failed");
            }
        }
        self.workers.shutdown().await;
        tracing::info!("coordinator_stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    /// Enqueue a task, waiting for queue space. Returns as soon as the task is
    /// queued; execution failures land in the task's result, never here.
    pub async fn submit_task(&self, task: Task) -> Result<TaskId> {
        self.registry.submit(task).await
    }

    /// Enqueue a task or fail with [`Error::QueueFull`].
    pub fn try_submit_task(&self, task: Task) -> Result<TaskId> {
        self.registry.try_submit(task)
    }

    /// Build a task from a payload and options, then submit it.
    pub async fn submit(
        &self,
        payload: TaskPayload,
        args: TaskArgs,
        options: SubmitOptions,
    ) -> Result<TaskId> {
        self.submit_task(options.into_task(payload, args)).await
    }

    /// Wait for a terminal result. `None` on unknown id or timeout.
    pub async fn get_task_result(
        &self,
        task_id: &TaskId,
        timeout: Option<Duration>,
    ) -> Option<TaskResult> {
        self.registry
            .results()
            .wait_for_terminal(task_id, timeout)
            .await
    }

    /// Current snapshot of a task's result, whatever its status.
    pub fn get_task_result_nowait(&self, task_id: &TaskId) -> Option<TaskResult> {
        self.registry.results().get(task_id)
    }

    /// Cancel a scheduled, queued, running or retrying task.
    pub fn cancel_task(&self, task_id: &TaskId) -> bool {
        self.scheduler.cancel_scheduled(task_id) || self.registry.cancel(task_id)
    }

    pub fn schedule_task(&self, task: Task, at: DateTime<Utc>) -> Result<TaskId> {
        self.scheduler.schedule_task(task, at)
    }

    /// Returns the recurring schedule id (not an instance id).
    pub fn schedule_recurring_task(
        &self,
        task: Task,
        interval: Duration,
        max_executions: Option<u32>,
    ) -> Result<TaskId> {
        self.scheduler
            .schedule_recurring_task(task, interval, max_executions)
    }

    pub fn cancel_recurring_task(&self, recurring_id: &TaskId) -> bool {
        self.scheduler.cancel_recurring(recurring_id)
    }

    pub fn recurring_task_info(&self, recurring_id: &TaskId) -> Option<RecurringInfo> {
        self.scheduler.recurring_info(recurring_id)
    }

    // =========================================================================
    // Protected calls
    // =========================================================================

    /// Run `operation` behind the rate limiter and the breaker for
    /// `service_name`.
    ///
    /// Rate limiting is checked first and never queues; an open breaker fails
    /// fast without invoking the operation.
    pub async fn execute_with_protections<F, Fut, T>(
        &self,
        service_name: &str,
        rate_limit_tokens: u32,
        operation: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.rate_limiter.acquire(rate_limit_tokens).await {
            self.metrics.lock().rate_limited_count += 1;
            tracing::warn!(service = service_name, tokens = rate_limit_tokens, "rate_limit_exceeded");
            return Err(Error::rate_limited(format!(
                "{} requested {} tokens",
                service_name, rate_limit_tokens
            )));
        }

        let breaker = self.circuit_breakers.get_or_create(service_name).await;
        let started = Instant::now();
        let result = breaker.call(operation).await;

        let mut metrics = self.metrics.lock();
        match &result {
            Ok(_) => metrics.record_success(started.elapsed()),
            Err(e) => {
                metrics.errors_count += 1;
                tracing::debug!(service = service_name, error = %e, "protected_call_failed");
            }
        }
        result
    }

    pub fn protection_metrics(&self) -> ProtectionMetrics {
        self.metrics.lock().clone()
    }

    // =========================================================================
    // Endpoints
    // =========================================================================

    pub async fn add_endpoint(&self, endpoint: ServiceEndpoint) -> Result<()> {
        self.load_balancer.add_endpoint(endpoint).await
    }

    pub async fn remove_endpoint(&self, id: &EndpointId) -> bool {
        self.load_balancer.remove_endpoint(id).await
    }

    pub async fn get_endpoint(&self, key: Option<&str>) -> Option<ServiceEndpoint> {
        self.load_balancer.get_endpoint(key).await
    }

    pub async fn set_endpoint_health(&self, id: &EndpointId, healthy: bool) -> Result<()> {
        self.load_balancer.set_endpoint_health(id, healthy).await
    }

    pub async fn record_endpoint_result(
        &self,
        id: &EndpointId,
        success: bool,
        latency: Duration,
    ) -> Result<()> {
        self.load_balancer.record_result(id, success, latency).await
    }

    // =========================================================================
    // Accessors and status
    // =========================================================================

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn circuit_breakers(&self) -> &CircuitBreakerRegistry {
        &self.circuit_breakers
    }

    pub fn load_balancer(&self) -> &LoadBalancer {
        &self.load_balancer
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub async fn get_manager_status(&self) -> ManagerStatus {
        let counts = self.registry.results().counts();
        ManagerStatus {
            running: self.is_running(),
            workers: self.workers.worker_count(),
            active_workers: self.workers.active_workers().await,
            queued: self.registry.queue().len(),
            active: counts.running,
            pending: counts.pending,
            retrying: counts.retrying,
            completed: counts.completed,
            failed: counts.failed,
            cancelled: counts.cancelled,
            total_tasks: counts.total(),
            scheduled: self.scheduler.scheduled_count(),
            recurring: self.scheduler.recurring_count(),
            worker_stats: self.workers.stats(),
            resource_status: self.resources.status().await,
        }
    }

    pub async fn get_system_status(&self) -> SystemStatus {
        SystemStatus {
            manager: self.get_manager_status().await,
            load_balancer: self.load_balancer.stats().await,
            endpoints: self.load_balancer.endpoints().await,
            circuit_breakers: self.circuit_breakers.snapshots().await,
            rate_limiter: RateLimiterStatus {
                available_tokens: self.rate_limiter.available_tokens().await,
                max_tokens: self.rate_limiter.max_tokens(),
                refill_rate: self.rate_limiter.refill_rate(),
            },
            protection: self.protection_metrics(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::circuit_breaker::CircuitState;
    use crate::kernel::types::TaskStatus;
    use crate::types::{CircuitBreakerConfig, RateLimitConfig, ResourceConfig, WorkerPoolConfig};

    fn config() -> Config {
        Config {
            workers: WorkerPoolConfig {
                workers: 2,
                compute_threads: 1,
                blocking_threads: 2,
                ..Default::default()
            },
            resources: ResourceConfig {
                sample_system: false,
                ..Default::default()
            },
            rate_limit: RateLimitConfig {
                max_tokens: 5.0,
                refill_rate: 0.0,
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 2,
                reset_timeout: Duration::from_secs(60),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut bad = config();
        bad.workers.workers = 0;
        assert!(matches!(Coordinator::new(bad), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_rate_limit_checked_before_breaker() {
        let coordinator = Coordinator::new(config()).unwrap();
        let calls = std::sync::atomic::AtomicUsize::new(0);

        let ok = coordinator
            .execute_with_protections("telegram", 5, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await;
        assert_eq!(ok.unwrap(), 1);

        let limited: Result<i32> = coordinator
            .execute_with_protections("telegram", 1, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(2)
            })
            .await;
        assert!(matches!(limited, Err(Error::RateLimitExceeded(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let metrics = coordinator.protection_metrics();
        assert_eq!(metrics.requests_processed, 1);
        assert_eq!(metrics.rate_limited_count, 1);
        assert!(coordinator.circuit_breakers().get("telegram").await.is_some());
    }

    #[tokio::test]
    async fn test_breaker_opens_after_failures() {
        let coordinator = Coordinator::new(Config {
            rate_limit: RateLimitConfig {
                max_tokens: 100.0,
                refill_rate: 0.0,
            },
            ..config()
        })
        .unwrap();

        for _ in 0..2 {
            let result: Result<()> = coordinator
                .execute_with_protections("openai", 1, || async {
                    Err(Error::execution("503"))
                })
                .await;
            assert!(matches!(result, Err(Error::Execution(_))));
        }

        let invoked = AtomicBool::new(false);
        let result: Result<()> = coordinator
            .execute_with_protections("openai", 1, || async {
                invoked.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
        assert!(!invoked.load(Ordering::SeqCst));

        let breaker = coordinator.circuit_breakers().get("openai").await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(coordinator.protection_metrics().errors_count, 3);
    }

    #[tokio::test]
    async fn test_submit_and_wait() {
        let coordinator = Coordinator::new(config()).unwrap();
        coordinator.start().await.unwrap();

        let id = coordinator
            .submit(
                TaskPayload::from_async(|ctx| async move {
                    let name: String = ctx.args.get("name")?;
                    Ok(serde_json::json!(format!("hello {}", name)))
                }),
                TaskArgs::new().with("name", "gavat").unwrap(),
                SubmitOptions::default(),
            )
            .await
            .unwrap();

        let result = coordinator
            .get_task_result(&id, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.result, Some(serde_json::json!("hello gavat")));

        let status = coordinator.get_manager_status().await;
        assert!(status.running);
        assert_eq!(status.completed, 1);
        assert_eq!(status.worker_stats.tasks_processed, 1);

        coordinator.shutdown().await;
        assert!(!coordinator.is_running());
    }

    #[tokio::test]
    async fn test_cancel_scheduled_through_coordinator() {
        let coordinator = Coordinator::new(config()).unwrap();
        let task = Task::new(
            "reminder",
            TaskPayload::from_async(|_ctx| async { Ok(serde_json::Value::Null) }),
        );
        let id = coordinator
            .schedule_task(task, Utc::now() + chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(
            coordinator.get_task_result_nowait(&id).unwrap().status,
            TaskStatus::Pending
        );
        assert!(coordinator.cancel_task(&id));
        assert_eq!(
            coordinator.get_task_result_nowait(&id).unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_configured_endpoints_registered_on_start() {
        let mut cfg = config();
        cfg.load_balancer.endpoints.push(crate::types::EndpointConfig {
            id: "api-1".to_string(),
            host: "10.0.0.1".to_string(),
            port: 8080,
            weight: 1,
            max_connections: 10,
        });
        let coordinator = Coordinator::new(cfg).unwrap();
        coordinator.start().await.unwrap();
        coordinator.start().await.unwrap();

        let endpoint = coordinator.get_endpoint(None).await.unwrap();
        assert_eq!(endpoint.url(), "http://10.0.0.1:8080");
        let status = coordinator.get_system_status().await;
        assert_eq!(status.endpoints.len(), 1);
        assert_eq!(status.rate_limiter.max_tokens, 5.0);
        coordinator.shutdown().await;
    }
}
