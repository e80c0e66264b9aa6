//! Configuration structures.
//!
//! Configuration is loaded from a JSON file; every section has defaults so a
//! partial file (or none at all) is valid.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::errors::{Error, Result};
use crate::kernel::load_balancer::LoadBalancingStrategy;

/// Global coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Worker pool and task queue configuration.
    #[serde(default)]
    pub workers: WorkerPoolConfig,

    /// Admission control limits.
    #[serde(default)]
    pub resources: ResourceConfig,

    /// Token bucket for protected calls.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Defaults for lazily created circuit breakers.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Load balancer strategy and initial endpoints.
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,

    /// Delayed/recurring task scheduler.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "config_loaded");
        Ok(config)
    }

    /// Reject configurations the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        let w = &self.workers;
        if w.workers == 0 {
            return Err(Error::config("workers.workers must be at least 1"));
        }
        if w.queue_capacity == 0 {
            return Err(Error::config("workers.queue_capacity must be at least 1"));
        }
        if w.blocking_threads == 0 || w.compute_threads == 0 {
            return Err(Error::config(
                "workers.blocking_threads and workers.compute_threads must be at least 1",
            ));
        }
        if self.resources.max_concurrent_tasks == 0 {
            return Err(Error::config(
                "resources.max_concurrent_tasks must be at least 1",
            ));
        }
        if self.rate_limit.max_tokens <= 0.0 || self.rate_limit.refill_rate < 0.0 {
            return Err(Error::config(
                "rate_limit.max_tokens must be positive and refill_rate non-negative",
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(Error::config(
                "circuit_breaker.failure_threshold must be at least 1",
            ));
        }
        if self.scheduler.tick_interval.is_zero() {
            return Err(Error::config("scheduler.tick_interval must be non-zero"));
        }
        for ep in &self.load_balancer.endpoints {
            if ep.id.is_empty() || ep.host.is_empty() {
                return Err(Error::config("endpoint id and host must be non-empty"));
            }
            if ep.weight == 0 {
                return Err(Error::config(format!(
                    "endpoint {} weight must be at least 1",
                    ep.id
                )));
            }
        }
        Ok(())
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of concurrent worker loops.
    pub workers: usize,

    /// Maximum number of tasks waiting in the priority queue.
    pub queue_capacity: usize,

    /// Permits for the secondary pool running ordinary blocking payloads.
    pub blocking_threads: usize,

    /// Threads of the isolated compute runtime for CPU-intensive task types.
    pub compute_threads: usize,

    /// Task types routed to the compute runtime.
    pub cpu_intensive_types: Vec<String>,

    /// Backoff after requeueing a task refused by admission control.
    #[serde(with = "humantime_serde")]
    pub resource_backoff: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_capacity: 1000,
            blocking_threads: 10,
            compute_threads: 4,
            cpu_intensive_types: vec![
                "data_analysis".to_string(),
                "batch_processing".to_string(),
                "computation".to_string(),
            ],
            resource_backoff: Duration::from_secs(1),
        }
    }
}

/// Admission control configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Hard cap on simultaneously running tasks.
    pub max_concurrent_tasks: usize,

    /// Memory budget reported in status output.
    pub max_memory_mb: u64,

    /// CPU ceiling used by the advisory host check.
    pub max_cpu_percent: f64,

    /// Sample host memory/CPU on admission (fails open when unavailable).
    pub sample_system: bool,

    /// Per-task memory estimate used by the worker pool.
    pub estimated_memory_mb: u64,

    /// Per-task CPU estimate used by the worker pool.
    pub estimated_cpu_percent: f64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 20,
            max_memory_mb: 1000,
            max_cpu_percent: 80.0,
            sample_system: true,
            estimated_memory_mb: 50,
            estimated_cpu_percent: 10.0,
        }
    }
}

/// Token bucket configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Bucket capacity.
    pub max_tokens: f64,

    /// Tokens added per second.
    pub refill_rate: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_tokens: 100.0,
            refill_rate: 10.0,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,

    /// Cool-down before a half-open probe is allowed.
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Load balancer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub strategy: LoadBalancingStrategy,

    /// Endpoints registered at startup.
    pub endpoints: Vec<EndpointConfig>,
}

/// Endpoint descriptor supplied by configuration or an admin API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub id: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_weight() -> u32 {
    1
}

fn default_max_connections() -> u32 {
    100
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often due scheduled/recurring tasks are moved into the queue.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
