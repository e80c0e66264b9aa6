//! Circuit breaker for protected service calls.
//!
//! Classic three-state breaker with a single half-open probe:
//!
//! ```text
//! CLOSED --(failures >= threshold)--> OPEN --(reset_timeout elapsed)--> HALF_OPEN
//!    ^                                  ^                                   |
//!    |                                  +------------(probe fails)----------+
//!    +-----------------------------(probe succeeds)-------------------------+
//! ```
//!
//! Breakers are created lazily per service name by [`CircuitBreakerRegistry`].

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::types::{CircuitBreakerConfig, Error, Result};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - calls pass through.
    Closed,
    /// Failing fast until the reset timeout elapses.
    Open,
    /// Exactly one probe call is allowed through.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    probe_in_flight: bool,
}

/// Point-in-time view of a breaker for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub reset_timeout_secs: f64,
}

/// Per-service failure isolation state machine.
#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

/// Clears the half-open probe flag if the probing call is dropped before
/// it reports an outcome, so the breaker cannot wedge in HALF_OPEN.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.inner.lock().probe_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            failure_threshold: config.failure_threshold.max(1),
            reset_timeout: config.reset_timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_time: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Current state (does not apply the OPEN → HALF_OPEN transition).
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock();
        CircuitBreakerSnapshot {
            service: self.service.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.failure_threshold,
            reset_timeout_secs: self.reset_timeout.as_secs_f64(),
        }
    }

    /// Run `operation` through the breaker.
    ///
    /// Returns [`Error::CircuitOpen`] without invoking the operation while the
    /// breaker is open or a half-open probe is already in flight.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let is_probe = self.admit()?;
        let mut guard = ProbeGuard {
            breaker: self,
            armed: is_probe,
        };

        let result = operation().await;
        match &result {
            Ok(_) => self.on_success(),
            Err(e) => self.on_failure(e),
        }
        guard.armed = false;
        result
    }

    /// Decide whether a call may proceed. `Ok(true)` marks the half-open probe.
    fn admit(&self) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let eligible = inner
                    .last_failure_time
                    .map(|t| Instant::now().saturating_duration_since(t) >= self.reset_timeout)
                    .unwrap_or(true);
                if eligible {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    tracing::info!(service = %self.service, "circuit_half_open");
                    Ok(true)
                } else {
                    Err(Error::circuit_open(self.service.clone()))
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(Error::circuit_open(self.service.clone()))
                } else {
                    inner.probe_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        let previous = inner.state;
        inner.failure_count = 0;
        inner.state = CircuitState::Closed;
        inner.probe_in_flight = false;
        if previous != CircuitState::Closed {
            tracing::info!(service = %self.service, "circuit_closed");
        }
    }

    fn on_failure(&self, error: &Error) {
        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_time = Some(Instant::now());
        inner.probe_in_flight = false;

        let should_open = inner.state == CircuitState::HalfOpen
            || inner.failure_count >= self.failure_threshold;
        if should_open && inner.state != CircuitState::Open {
            inner.state = CircuitState::Open;
            tracing::warn!(
                service = %self.service,
                failure_count = inner.failure_count,
                failure_threshold = self.failure_threshold,
                error = %error,
                "circuit_opened"
            );
        }
    }
}

/// Lazily populated map of service name → breaker.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Get the breaker for `service`, creating it on first use.
    pub async fn get_or_create(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(service) {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write().await;
        breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                tracing::debug!(service = %service, "circuit_breaker_created");
                Arc::new(CircuitBreaker::new(service, &self.config))
            })
            .clone()
    }

    pub async fn get(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().await.get(service).cloned()
    }

    /// State of every known breaker, keyed by service name.
    pub async fn states(&self) -> HashMap<String, CircuitState> {
        self.breakers
            .read()
            .await
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.state()))
            .collect()
    }

    pub async fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut snapshots: Vec<_> = self
            .breakers
            .read()
            .await
            .values()
            .map(|b| b.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.service.cmp(&b.service));
        snapshots
    }
}
