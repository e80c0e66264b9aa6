//! Kernel - task execution and traffic shaping.
//!
//! The [`Coordinator`] composes every subsystem; each one is a plain struct
//! with its own lock, so no single lock serializes the system.
//!
//! ```text
//!                      ┌───────────────────────────────────────────┐
//!   submit_task   →    │               Coordinator                 │
//!   schedule_*    →    │  ┌─────────┐  ┌──────────┐  ┌──────────┐  │
//!                      │  │Scheduler│→ │ Priority │→ │ Worker   │  │
//!                      │  └─────────┘  │  Queue   │  │  Pool    │  │
//!                      │               └──────────┘  └────┬─────┘  │
//!                      │        ResultStore  ←────────────┤        │
//!                      │        ResourceManager ←─────────┘        │
//!   execute_with_ →    │  ┌─────────┐  ┌──────────┐  ┌──────────┐  │
//!   protections        │  │RateLimit│→ │ Circuit  │  │  Load    │  │
//!                      │  │   er    │  │ Breakers │  │ Balancer │  │
//!                      │  └─────────┘  └──────────┘  └──────────┘  │
//!                      └───────────────────────────────────────────┘
//! ```

pub mod circuit_breaker;
pub mod coordinator;
pub mod executor;
pub mod load_balancer;
pub mod queue;
pub mod rate_limiter;
pub mod recovery;
pub mod registry;
pub mod resources;
pub mod results;
pub mod scheduler;
pub mod types;
pub mod worker;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerRegistry, CircuitBreakerSnapshot, CircuitState,
};
pub use coordinator::{
    Coordinator, ManagerStatus, ProtectionMetrics, RateLimiterStatus, SystemStatus,
};
pub use executor::ExecutionLane;
pub use load_balancer::{LoadBalancer, LoadBalancerStats, LoadBalancingStrategy, ServiceEndpoint};
pub use queue::PriorityTaskQueue;
pub use rate_limiter::RateLimiter;
pub use recovery::{with_recovery, with_recovery_async};
pub use resources::{ResourceManager, ResourceStatus};
pub use results::{ResultStore, StatusCounts};
pub use scheduler::{RecurringInfo, Scheduler};
pub use types::{
    ProgressReporter, SubmitOptions, Task, TaskArgs, TaskContext, TaskHandler, TaskOutput,
    TaskPayload, TaskPriority, TaskResult, TaskStatus,
};
pub use worker::{WorkerPool, WorkerStats};
