//! Core types for the execution core.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (TaskId, EndpointId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for workers, protections and balancing

mod config;
mod errors;
mod ids;

pub use config::{
    CircuitBreakerConfig, Config, EndpointConfig, LoadBalancerConfig, ObservabilityConfig,
    RateLimitConfig, ResourceConfig, SchedulerConfig, WorkerPoolConfig,
};
pub use errors::{Error, Result};
pub use ids::{EndpointId, TaskId};
