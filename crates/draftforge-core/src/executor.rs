// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Chunk executor: runs one chunk's generation attempts.
//!
//! An attempt acquires a rate-limiter permit, calls the provider under the
//! session's remaining time budget, and classifies failures. Transient and
//! rate-limited failures retry with exponential backoff up to the
//! configured ceiling; permanent failures fail the chunk immediately. Every
//! await point races the session's cancellation signal, and an abandoned
//! provider call's late result is discarded by the store's terminal-row
//! guard.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::CoreError;
use crate::limiter::RateLimiter;
use crate::persistence::StateStore;
use crate::provider::{ChunkRequest, ProviderClient, ProviderError};
use crate::session::{ChunkRecord, ChunkStatus, EventRecord};

/// Delay between retries of a failed state-store write.
const STORE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Terminal outcome of one chunk's execution, reported to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkOutcome {
    /// The chunk produced output.
    Succeeded,
    /// The chunk exhausted its retries or failed permanently.
    Failed,
    /// The session's wall-clock budget ran out.
    TimedOut,
    /// The session was cancelled while the chunk was in flight.
    Cancelled,
    /// State could not be persisted within the configured retry bound.
    StoreFailed,
}

enum AttemptDisposition {
    Retry,
    Done(ChunkOutcome),
}

/// Executes chunk generation attempts against the shared rate limiter and
/// provider client.
pub(crate) struct ChunkExecutor {
    store: Arc<dyn StateStore>,
    provider: Arc<dyn ProviderClient>,
    limiter: Arc<RateLimiter>,
    config: Arc<Config>,
}

impl ChunkExecutor {
    pub(crate) fn new(
        store: Arc<dyn StateStore>,
        provider: Arc<dyn ProviderClient>,
        limiter: Arc<RateLimiter>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            provider,
            limiter,
            config,
        }
    }

    /// Run one chunk to a terminal state.
    ///
    /// `session_deadline` is the session's absolute wall-clock budget; an
    /// attempt that cannot fit the remaining budget is not started.
    pub(crate) async fn execute(
        &self,
        mut chunk: ChunkRecord,
        owner_context: String,
        session_deadline: Instant,
        mut cancel: watch::Receiver<bool>,
    ) -> ChunkOutcome {
        loop {
            if *cancel.borrow() {
                return self.finish(&mut chunk, ChunkStatus::Cancelled, None).await;
            }

            let Some(remaining) = remaining_budget(session_deadline) else {
                return self.finish(&mut chunk, ChunkStatus::TimedOut, None).await;
            };

            chunk.attempt += 1;
            chunk.status = ChunkStatus::Running;
            chunk.updated_at = Utc::now();
            match self.persist(&chunk).await {
                Ok(true) => {}
                Ok(false) => {
                    // The scheduler already finalized this chunk
                    return ChunkOutcome::Cancelled;
                }
                Err(e) => {
                    warn!(
                        session_id = %chunk.session_id,
                        chunk_index = chunk.index,
                        error = %e,
                        "Chunk state write failed, giving up"
                    );
                    return ChunkOutcome::StoreFailed;
                }
            }

            // Wait for a rate-limiter permit without holding other resources
            let permit_timeout = self.config.permit_acquire_timeout.min(remaining);
            let acquired = tokio::select! {
                biased;

                _ = cancel.changed() => {
                    return self.finish(&mut chunk, ChunkStatus::Cancelled, None).await;
                }

                result = self.limiter.acquire(chunk.estimated_tokens, permit_timeout) => result,
            };

            if let Err(e) = acquired {
                debug!(
                    session_id = %chunk.session_id,
                    chunk_index = chunk.index,
                    attempt = chunk.attempt,
                    error = %e,
                    "Permit acquisition timed out"
                );
                match self
                    .handle_retryable(&mut chunk, &e.to_string(), None, session_deadline, &mut cancel)
                    .await
                {
                    AttemptDisposition::Retry => continue,
                    AttemptDisposition::Done(outcome) => return outcome,
                }
            }

            // Budget may have shrunk while waiting for the permit
            let Some(remaining) = remaining_budget(session_deadline) else {
                return self.finish(&mut chunk, ChunkStatus::TimedOut, None).await;
            };

            let request = ChunkRequest {
                session_id: chunk.session_id.clone(),
                owner_context: owner_context.clone(),
                chunk_index: chunk.index,
                prompt: chunk.prompt.clone(),
                estimated_tokens: chunk.estimated_tokens,
                deadline: remaining,
            };

            let result = tokio::select! {
                biased;

                _ = cancel.changed() => {
                    // The provider call is abandoned; any late result is discarded
                    return self.finish(&mut chunk, ChunkStatus::Cancelled, None).await;
                }

                result = tokio::time::timeout(remaining, self.provider.generate(&request)) => result,
            };

            match result {
                Err(_elapsed) => {
                    return self.finish(&mut chunk, ChunkStatus::TimedOut, None).await;
                }
                Ok(Ok(generated)) => {
                    debug!(
                        session_id = %chunk.session_id,
                        chunk_index = chunk.index,
                        attempt = chunk.attempt,
                        tokens_used = ?generated.tokens_used,
                        "Chunk generation succeeded"
                    );
                    chunk.output = Some(generated.content);
                    chunk.error = None;
                    return self.finish(&mut chunk, ChunkStatus::Succeeded, None).await;
                }
                Ok(Err(provider_err)) => {
                    if !provider_err.is_retryable() {
                        warn!(
                            session_id = %chunk.session_id,
                            chunk_index = chunk.index,
                            attempt = chunk.attempt,
                            error = %provider_err,
                            "Permanent provider failure"
                        );
                        return self
                            .finish(
                                &mut chunk,
                                ChunkStatus::Failed,
                                Some(provider_err.to_string()),
                            )
                            .await;
                    }

                    let retry_after = provider_err.retry_after();
                    match self
                        .handle_retryable(
                            &mut chunk,
                            &provider_err.to_string(),
                            retry_after,
                            session_deadline,
                            &mut cancel,
                        )
                        .await
                    {
                        AttemptDisposition::Retry => continue,
                        AttemptDisposition::Done(outcome) => return outcome,
                    }
                }
            }
        }
    }

    /// Decide what to do after a retryable attempt failure: give up once the
    /// retry ceiling is reached, otherwise back off and retry. A backoff
    /// that would run past the session deadline means the next attempt is
    /// never started.
    async fn handle_retryable(
        &self,
        chunk: &mut ChunkRecord,
        message: &str,
        retry_after: Option<Duration>,
        session_deadline: Instant,
        cancel: &mut watch::Receiver<bool>,
    ) -> AttemptDisposition {
        if chunk.attempt > self.config.max_retries_per_chunk {
            warn!(
                session_id = %chunk.session_id,
                chunk_index = chunk.index,
                attempt = chunk.attempt,
                "Retry ceiling exhausted"
            );
            let error = format!(
                "retries exhausted after {} attempts: {}",
                chunk.attempt, message
            );
            return AttemptDisposition::Done(
                self.finish(chunk, ChunkStatus::Failed, Some(error)).await,
            );
        }

        chunk.status = ChunkStatus::Retrying;
        chunk.error = Some(message.to_string());
        chunk.updated_at = Utc::now();
        match self.persist(chunk).await {
            Ok(true) => {}
            Ok(false) => return AttemptDisposition::Done(ChunkOutcome::Cancelled),
            Err(_) => return AttemptDisposition::Done(ChunkOutcome::StoreFailed),
        }
        self.record_event(EventRecord::chunk(
            &chunk.session_id,
            chunk.index,
            "chunk_retrying",
            Some(message.to_string()),
        ))
        .await;

        let delay = backoff_delay(
            self.config.retry_backoff_base,
            self.config.retry_backoff_cap,
            chunk.attempt,
            retry_after,
        );
        debug!(
            session_id = %chunk.session_id,
            chunk_index = chunk.index,
            attempt = chunk.attempt,
            delay_ms = delay.as_millis() as u64,
            "Backing off before retry"
        );

        match remaining_budget(session_deadline) {
            Some(remaining) if remaining > delay => {}
            _ => {
                // The next attempt would start past the session deadline
                return AttemptDisposition::Done(
                    self.finish(chunk, ChunkStatus::TimedOut, None).await,
                );
            }
        }

        tokio::select! {
            biased;

            _ = cancel.changed() => {
                AttemptDisposition::Done(self.finish(chunk, ChunkStatus::Cancelled, None).await)
            }

            _ = tokio::time::sleep(delay) => AttemptDisposition::Retry,
        }
    }

    /// Write the chunk's terminal state and report the matching outcome.
    async fn finish(
        &self,
        chunk: &mut ChunkRecord,
        status: ChunkStatus,
        error: Option<String>,
    ) -> ChunkOutcome {
        chunk.status = status;
        if error.is_some() {
            chunk.error = error;
        }
        chunk.updated_at = Utc::now();

        let outcome = match status {
            ChunkStatus::Succeeded => ChunkOutcome::Succeeded,
            ChunkStatus::Failed => ChunkOutcome::Failed,
            ChunkStatus::TimedOut => ChunkOutcome::TimedOut,
            _ => ChunkOutcome::Cancelled,
        };

        match self.persist(chunk).await {
            Ok(true) => {
                self.record_event(EventRecord::chunk(
                    &chunk.session_id,
                    chunk.index,
                    &format!("chunk_{}", status.as_str()),
                    chunk.error.clone(),
                ))
                .await;
                outcome
            }
            // The scheduler finalized the chunk first; its word stands
            Ok(false) => ChunkOutcome::Cancelled,
            Err(_) => ChunkOutcome::StoreFailed,
        }
    }

    /// Persist a chunk row, retrying the write a bounded number of times.
    async fn persist(&self, chunk: &ChunkRecord) -> Result<bool, CoreError> {
        let mut last_err = None;
        for _ in 0..=self.config.store_write_retries {
            match self.store.update_chunk(chunk).await {
                Ok(applied) => return Ok(applied),
                Err(e) => {
                    debug!(
                        session_id = %chunk.session_id,
                        chunk_index = chunk.index,
                        error = %e,
                        "Chunk state write failed, retrying"
                    );
                    last_err = Some(e);
                    tokio::time::sleep(STORE_RETRY_DELAY).await;
                }
            }
        }
        Err(last_err.expect("at least one write attempt"))
    }

    async fn record_event(&self, event: EventRecord) {
        if let Err(e) = self.store.insert_event(&event).await {
            debug!(
                session_id = %event.session_id,
                event_type = %event.event_type,
                error = %e,
                "Failed to record event"
            );
        }
    }
}

/// Time left until `deadline`, or None once it has passed.
fn remaining_budget(deadline: Instant) -> Option<Duration> {
    let remaining = deadline.checked_duration_since(Instant::now())?;
    if remaining.is_zero() {
        None
    } else {
        Some(remaining)
    }
}

/// Exponential backoff for attempt `attempt` (1-based), doubling from
/// `base` and capped at `cap`. A provider-supplied `retry_after` takes
/// precedence when it is larger than the computed delay.
fn backoff_delay(
    base: Duration,
    cap: Duration,
    attempt: u32,
    retry_after: Option<Duration>,
) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let exp = base.saturating_mul(1u32 << exponent).min(cap);
    match retry_after {
        Some(suggested) => exp.max(suggested),
        None => exp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(8);

        assert_eq!(backoff_delay(base, cap, 1, None), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, cap, 2, None), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, cap, 3, None), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, cap, 4, None), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, cap, 5, None), Duration::from_secs(8));
        // Capped from here on
        assert_eq!(backoff_delay(base, cap, 6, None), Duration::from_secs(8));
        assert_eq!(backoff_delay(base, cap, 30, None), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_prefers_larger_retry_after() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(60);

        // Suggested delay larger than computed: use it
        assert_eq!(
            backoff_delay(base, cap, 1, Some(Duration::from_secs(10))),
            Duration::from_secs(10)
        );
        // Computed delay larger than suggestion: keep the computed one
        assert_eq!(
            backoff_delay(base, cap, 6, Some(Duration::from_secs(1))),
            Duration::from_secs(16)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_budget() {
        let deadline = Instant::now() + Duration::from_secs(10);
        assert!(remaining_budget(deadline).is_some());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(remaining_budget(deadline).is_none());
    }
}
