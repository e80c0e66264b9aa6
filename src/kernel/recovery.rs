//! Panic recovery for task payloads.
//!
//! A panicking task function fails its own task (and may be retried); it
//! never takes down the worker loop that ran it.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::types::{Error, Result};

/// Run a synchronous payload, converting a panic into an execution error.
///
/// # Example
/// ```
/// use gavat_core::kernel::with_recovery;
///
/// let result: gavat_core::Result<u32> = with_recovery(|| Ok(7), "compute");
/// assert_eq!(result.unwrap(), 7);
/// ```
pub fn with_recovery<F, T>(operation: F, operation_name: &str) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    match catch_unwind(AssertUnwindSafe(operation)) {
        Ok(result) => result,
        Err(payload) => Err(panic_error(operation_name, payload.as_ref())),
    }
}

/// Await a payload future, converting a panic at any poll into an execution
/// error.
pub async fn with_recovery_async<F, Fut, T>(operation: F, operation_name: &str) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let future = match catch_unwind(AssertUnwindSafe(operation)) {
        Ok(future) => future,
        Err(payload) => return Err(panic_error(operation_name, payload.as_ref())),
    };

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(panic_error(operation_name, payload.as_ref())),
    }
}

fn panic_error(operation_name: &str, payload: &(dyn Any + Send)) -> Error {
    let panic_msg = extract_panic_message(payload);
    tracing::error!(operation = operation_name, panic = %panic_msg, "panic_recovered");
    Error::execution(format!("panic in {}: {}", operation_name, panic_msg))
}

fn extract_panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic (no message)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_recovery_passes_errors_through() {
        let result: Result<()> = with_recovery(|| Err(Error::validation("bad args")), "task");
        assert!(matches!(result, Err(Error::Validation(msg)) if msg == "bad args"));
    }

    #[test]
    fn test_with_recovery_panic_becomes_execution_error() {
        let result: Result<()> = with_recovery(|| panic!("worker exploded"), "send_message");
        match result {
            Err(Error::Execution(msg)) => {
                assert!(msg.contains("send_message"));
                assert!(msg.contains("worker exploded"));
            }
            other => panic!("expected execution error, got {:?}", other),
        }
    }

    #[test]
    fn test_with_recovery_formatted_panic() {
        let result: Result<()> = with_recovery(|| panic!("{} failed", "step"), "task");
        assert!(result.unwrap_err().to_string().contains("step failed"));
    }

    #[tokio::test]
    async fn test_with_recovery_async_success() {
        let result = with_recovery_async(|| async { Ok(42) }, "async_task").await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_recovery_async_panic_after_await() {
        let result: Result<()> = with_recovery_async(
            || async {
                tokio::task::yield_now().await;
                if true {
                    panic!("late panic");
                }
                Ok(())
            },
            "async_task",
        )
        .await;
        assert!(matches!(result, Err(Error::Execution(msg)) if msg.contains("late panic")));
    }
}
