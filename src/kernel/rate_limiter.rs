//! Rate limiting and throttling.
//!
//! Token bucket admission gate for protected calls. A rejected acquire
//! returns immediately; the caller decides what to do.

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::types::RateLimitConfig;

/// Bucket state, guarded by the limiter's lock.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Add tokens for the time elapsed since the last refill, capped at `max_tokens`.
    fn refill(&mut self, now: Instant, refill_rate: f64, max_tokens: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_rate).min(max_tokens);
        self.last_refill = now;
    }
}

/// Token bucket rate limiter.
///
/// One instance per protected scope; shared by reference between callers.
#[derive(Debug)]
pub struct RateLimiter {
    max_tokens: f64,
    refill_rate: f64,
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    /// Create a full bucket.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            refill_rate: config.refill_rate,
            bucket: Mutex::new(TokenBucket {
                tokens: config.max_tokens,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Try to take `tokens` from the bucket.
    pub async fn acquire(&self, tokens: u32) -> bool {
        let requested = f64::from(tokens);
        let mut bucket = self.bucket.lock().await;
        bucket.refill(Instant::now(), self.refill_rate, self.max_tokens);

        if bucket.tokens >= requested {
            bucket.tokens -= requested;
            true
        } else {
            tracing::debug!(
                requested = tokens,
                available = bucket.tokens,
                "rate_limit_rejected"
            );
            false
        }
    }

    /// Tokens currently available (refilled view, nothing consumed).
    pub async fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        bucket.refill(Instant::now(), self.refill_rate, self.max_tokens);
        bucket.tokens
    }

    pub fn max_tokens(&self) -> f64 {
        self.max_tokens
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
