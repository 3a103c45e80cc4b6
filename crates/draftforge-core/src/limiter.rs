// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-wide provider rate limiter.
//!
//! A dual token bucket over two dimensions at once: provider calls per
//! minute and provider tokens per minute. Both refill continuously at the
//! configured rate, with burst capacity of one full minute. The bucket is
//! the single serialization point protecting the external provider; it is
//! shared by every chunk executor across all sessions.
//!
//! Waiting is done by computed sleep outside the lock, so an acquirer only
//! suspends its own task. The shortfall is recomputed after each sleep
//! because concurrent acquirers may have drained the bucket in between.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Authorization for one provider call within the current window.
///
/// The bucket consumes the cost at acquisition, which is the accounting
/// step; the permit itself is a receipt held for the duration of the call.
#[derive(Debug, Clone, Copy)]
pub struct Permit {
    /// Call-count cost (always 1).
    pub calls: u32,
    /// Token cost that was deducted.
    pub estimated_tokens: u32,
}

/// Errors from permit acquisition.
#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    /// The acquisition timeout elapsed before both dimensions had capacity.
    #[error("rate limiter permit not acquired within {waited_ms}ms")]
    Timeout {
        /// How long the acquirer waited.
        waited_ms: u64,
    },
}

struct BucketState {
    call_tokens: f64,
    token_tokens: f64,
    last_refill: Instant,
}

/// Process-wide dual token bucket rate limiter.
pub struct RateLimiter {
    state: Mutex<BucketState>,
    calls_per_minute: u32,
    tokens_per_minute: u64,
}

impl RateLimiter {
    /// Create a limiter with full burst capacity in both dimensions.
    pub fn new(calls_per_minute: u32, tokens_per_minute: u64) -> Self {
        Self {
            state: Mutex::new(BucketState {
                call_tokens: calls_per_minute as f64,
                token_tokens: tokens_per_minute as f64,
                last_refill: Instant::now(),
            }),
            calls_per_minute,
            tokens_per_minute,
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.call_tokens = (state.call_tokens + elapsed * self.calls_per_minute as f64 / 60.0)
            .min(self.calls_per_minute as f64);
        state.token_tokens = (state.token_tokens + elapsed * self.tokens_per_minute as f64 / 60.0)
            .min(self.tokens_per_minute as f64);
        state.last_refill = now;
    }

    /// Block the calling task until both dimensions have capacity for one
    /// call of `estimated_tokens` cost, or until `timeout` elapses.
    ///
    /// A token cost larger than the per-minute budget is clamped to the
    /// budget, so an oversized chunk is admitted once the bucket is full
    /// rather than waiting forever.
    pub async fn acquire(
        &self,
        estimated_tokens: u32,
        timeout: Duration,
    ) -> Result<Permit, AcquireError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let token_cost = (estimated_tokens as f64).min(self.tokens_per_minute as f64);

        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);

                if state.call_tokens >= 1.0 && state.token_tokens >= token_cost {
                    state.call_tokens -= 1.0;
                    state.token_tokens -= token_cost;
                    return Ok(Permit {
                        calls: 1,
                        estimated_tokens,
                    });
                }

                let call_wait = if state.call_tokens >= 1.0 {
                    0.0
                } else {
                    (1.0 - state.call_tokens) * 60.0 / self.calls_per_minute as f64
                };
                let token_wait = if state.token_tokens >= token_cost {
                    0.0
                } else {
                    (token_cost - state.token_tokens) * 60.0 / self.tokens_per_minute as f64
                };
                Duration::from_secs_f64(call_wait.max(token_wait))
            };

            let now = Instant::now();
            if now + wait > deadline {
                return Err(AcquireError::Timeout {
                    waited_ms: now.duration_since(started).as_millis() as u64,
                });
            }
            tokio::time::sleep(wait).await;
        }
    }
}
