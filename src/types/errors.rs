//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the execution core.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed task definition, rejected synchronously at submission.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown task, endpoint or schedule entry.
    #[error("not found: {0}")]
    NotFound(String),

    /// Protected call refused by the token bucket.
    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Protected call refused without invoking the wrapped function.
    #[error("circuit breaker is open for {service}")]
    CircuitOpen { service: String },

    /// Admission control refused execution (requeued, never surfaced to callers).
    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),

    /// Bounded task queue is full.
    #[error("queue full: {0}")]
    QueueFull(String),

    /// Task-level timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The task function (or protected operation) failed.
    #[error("execution error: {0}")]
    Execution(String),

    /// Cancellation by caller or shutdown.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Invalid or unreadable configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable error code for API layers that wrap the core.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "INVALID_ARGUMENT",
            Error::NotFound(_) => "NOT_FOUND",
            Error::RateLimitExceeded(_) => "RESOURCE_EXHAUSTED",
            Error::CircuitOpen { .. } => "UNAVAILABLE",
            Error::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            Error::QueueFull(_) => "RESOURCE_EXHAUSTED",
            Error::Timeout(_) => "DEADLINE_EXCEEDED",
            Error::Execution(_) => "INTERNAL",
            Error::Cancelled(_) => "CANCELLED",
            Error::Config(_) => "INVALID_ARGUMENT",
            Error::Internal(_) => "INTERNAL",
            Error::Serialization(_) => "INTERNAL",
            Error::Io(_) => "INTERNAL",
        }
    }

    /// Whether the task path may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Execution(_))
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self::RateLimitExceeded(msg.into())
    }

    pub fn circuit_open(service: impl Into<String>) -> Self {
        Self::CircuitOpen {
            service: service.into(),
        }
    }

    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    pub fn queue_full(msg: impl Into<String>) -> Self {
        Self::QueueFull(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
