//! # gavat-core - task execution and traffic shaping
//!
//! Asynchronous execution core of the Gavat persona-automation platform:
//! - Priority task queue with dependencies, retries, timeouts and cancellation
//! - Delayed and recurring scheduling
//! - Worker pool with resource admission control, a bounded blocking pool and
//!   an isolated compute runtime for CPU-heavy task types
//! - Token-bucket rate limiting and per-service circuit breakers
//! - Load balancing over service endpoints (five strategies)
//!
//! Everything is reached through [`kernel::Coordinator`]:
//!
//! ```no_run
//! use gavat_core::kernel::{Coordinator, Task, TaskPayload};
//! use gavat_core::Config;
//!
//! # async fn run() -> gavat_core::Result<()> {
//! let coordinator = Coordinator::new(Config::default())?;
//! coordinator.start().await?;
//!
//! let task = Task::new(
//!     "send_message",
//!     TaskPayload::from_async(|_ctx| async { Ok(serde_json::json!({"sent": true})) }),
//! );
//! let id = coordinator.submit_task(task).await?;
//! let result = coordinator.get_task_result(&id, None).await;
//! coordinator.shutdown().await;
//! # Ok(())
//! # }
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod kernel;
pub mod types;

// Internal utilities
pub mod observability;

pub use types::{Config, Error, Result};
