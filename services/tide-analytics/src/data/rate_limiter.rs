//! Token bucket rate limiter for API request throttling.
//!
//! Proactively limits outgoing request rates so upstream limits are never
//! hit. A caller that cannot get a token within its deadline is told to back
//! off instead of waiting unboundedly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// A token bucket rate limiter.
///
/// Allows up to `capacity` requests per second, with tokens refilled
/// continuously. Tokens are stored scaled by 1000 for sub-token precision.
#[derive(Debug)]
pub struct RateLimiter {
    /// Maximum tokens in the bucket
    capacity: u32,
    /// Current available tokens (scaled by 1000)
    tokens: AtomicU64,
    /// Tokens added per millisecond (scaled by 1000)
    refill_rate_per_ms: f64,
    /// Last refill timestamp
    last_refill: Mutex<Instant>,
    /// Name for logging
    name: String,
}

impl RateLimiter {
    /// Create a rate limiter allowing `requests_per_second` sustained calls.
    pub fn from_rps(name: impl Into<String>, requests_per_second: u32) -> Self {
        let capacity = requests_per_second.max(1);
        let refill_rate_per_ms = f64::from(capacity) / 1000.0;

        Self {
            capacity,
            tokens: AtomicU64::new(u64::from(capacity) * 1000),
            refill_rate_per_ms,
            last_refill: Mutex::new(Instant::now()),
            name: name.into(),
        }
    }

    /// Try to acquire a token without waiting.
    pub fn try_acquire(&self) -> bool {
        self.refill();

        loop {
            let current = self.tokens.load(Ordering::Relaxed);
            if current < 1000 {
                return false;
            }

            let new_value = current - 1000;
            if self
                .tokens
                .compare_exchange_weak(current, new_value, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Acquire a token, waiting until `deadline` at most.
    ///
    /// Returns `false` if the deadline passed without a token becoming
    /// available; the caller maps that to a rate-limit error.
    pub async fn acquire_until(&self, deadline: Instant) -> bool {
        loop {
            if self.try_acquire() {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(limiter = %self.name, "Deadline reached while waiting for token");
                return false;
            }

            // Wait roughly one token's worth, bounded by the deadline
            let one_token_ms = (1.0 / self.refill_rate_per_ms).ceil() as u64;
            let wait = Duration::from_millis(one_token_ms.clamp(10, 1000)).min(deadline - now);

            debug!(
                limiter = %self.name,
                wait_ms = wait.as_millis() as u64,
                "Rate limited, waiting for token"
            );

            tokio::time::sleep(wait).await;
        }
    }

    /// Refill tokens based on elapsed time.
    fn refill(&self) {
        // try_lock keeps the hot path non-blocking; a missed refill is
        // picked up by the next caller
        if let Ok(mut last_refill) = self.last_refill.try_lock() {
            let now = Instant::now();
            let elapsed_ms = now.duration_since(*last_refill).as_millis() as f64;

            if elapsed_ms > 0.0 {
                let new_tokens = (elapsed_ms * self.refill_rate_per_ms * 1000.0) as u64;

                if new_tokens > 0 {
                    let max_tokens = u64::from(self.capacity) * 1000;

                    loop {
                        let current = self.tokens.load(Ordering::Relaxed);
                        let new_value = (current + new_tokens).min(max_tokens);

                        if current == new_value
                            || self
                                .tokens
                                .compare_exchange_weak(
                                    current,
                                    new_value,
                                    Ordering::Relaxed,
                                    Ordering::Relaxed,
                                )
                                .is_ok()
                        {
                            break;
                        }
                    }

                    *last_refill = now;
                }
            }
        }
    }

    /// Current available tokens (for monitoring).
    pub fn available_tokens(&self) -> f64 {
        self.refill();
        self.tokens.load(Ordering::Relaxed) as f64 / 1000.0
    }

    /// Configured capacity.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

// ============================================================================
// Tests
// ============================================================================
