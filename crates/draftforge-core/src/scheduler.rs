// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session scheduler: drives one generation session to a terminal state.
//!
//! The scheduler owns its session exclusively while active. It admits
//! chunks index-ascending into at most `max_chunks_per_session` concurrent
//! executor tasks, replacing a completed slot with the next Pending chunk
//! as capacity frees. Completion order is unspecified; only admission order
//! is deterministic.
//!
//! Failure policy is fail-fast: the first chunk that exhausts its retries
//! (or fails permanently) cancels the rest of the session, because a
//! partial document is not a valid deliverable. Timeout is the same
//! cancellation cascade triggered by the session deadline instead of an
//! external request.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::CoreError;
use crate::executor::{ChunkExecutor, ChunkOutcome};
use crate::persistence::StateStore;
use crate::session::{ChunkRecord, EventRecord, SessionStatus};

/// How long to wait for in-flight chunk tasks to acknowledge cancellation
/// before finalizing the session anyway.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

/// Delay between retries of a failed session-state write.
const STORE_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(100);

/// Drives one session from Queued to a terminal state.
pub(crate) struct SessionScheduler {
    session_id: String,
    owner_context: String,
    chunks: Vec<ChunkRecord>,
    config: Arc<Config>,
    store: Arc<dyn StateStore>,
    executor: Arc<ChunkExecutor>,
    cancel_rx: watch::Receiver<bool>,
    deadline: Instant,
}

impl SessionScheduler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session_id: String,
        owner_context: String,
        chunks: Vec<ChunkRecord>,
        config: Arc<Config>,
        store: Arc<dyn StateStore>,
        executor: Arc<ChunkExecutor>,
        cancel_rx: watch::Receiver<bool>,
        deadline: Instant,
    ) -> Self {
        Self {
            session_id,
            owner_context,
            chunks,
            config,
            store,
            executor,
            cancel_rx,
            deadline,
        }
    }

    /// Run the session to completion. Returns the terminal status.
    pub(crate) async fn run(mut self) -> SessionStatus {
        let total = self.chunks.len() as u32;

        if let Err(e) = self
            .persist_running(Utc::now())
            .await
        {
            error!(
                session_id = %self.session_id,
                error = %e,
                "Failed to mark session running"
            );
            return self
                .finalize(
                    SessionStatus::Failed,
                    Some("persistence_failure"),
                    Some("could not persist session start"),
                )
                .await;
        }
        self.record_event(EventRecord::session(&self.session_id, "session_started", None))
            .await;

        let (chunk_cancel_tx, chunk_cancel_rx) = watch::channel(false);
        let (done_tx, mut done_rx) = mpsc::channel::<(u32, ChunkOutcome)>(self.chunks.len().max(1));

        let mut pending = std::mem::take(&mut self.chunks).into_iter();
        let mut in_flight = 0usize;
        let mut succeeded = 0u32;

        let (status, reason, error_msg): (SessionStatus, Option<&str>, Option<String>) = loop {
            // Admit chunks index-ascending up to the per-session ceiling
            while in_flight < self.config.max_chunks_per_session {
                let Some(chunk) = pending.next() else { break };
                debug!(
                    session_id = %self.session_id,
                    chunk_index = chunk.index,
                    "Dispatching chunk"
                );
                let executor = self.executor.clone();
                let owner_context = self.owner_context.clone();
                let deadline = self.deadline;
                let cancel = chunk_cancel_rx.clone();
                let done = done_tx.clone();
                let index = chunk.index;
                tokio::spawn(async move {
                    let outcome = executor.execute(chunk, owner_context, deadline, cancel).await;
                    let _ = done.send((index, outcome)).await;
                });
                in_flight += 1;
            }

            tokio::select! {
                biased;

                changed = self.cancel_rx.changed() => {
                    if changed.is_err() || *self.cancel_rx.borrow() {
                        break (SessionStatus::Cancelled, Some("cancelled"), None);
                    }
                }

                _ = tokio::time::sleep_until(self.deadline) => {
                    break (
                        SessionStatus::TimedOut,
                        Some("timeout"),
                        Some(format!(
                            "generation timeout of {}s exceeded",
                            self.config.generation_timeout.as_secs()
                        )),
                    );
                }

                completion = done_rx.recv() => {
                    // The scheduler keeps its own done_tx clone alive, so the
                    // channel cannot close while chunks are outstanding
                    let Some((index, outcome)) = completion else { continue };
                    in_flight -= 1;

                    match outcome {
                        ChunkOutcome::Succeeded => {
                            succeeded += 1;
                            if succeeded == total {
                                break (SessionStatus::Completed, None, None);
                            }
                        }
                        ChunkOutcome::Failed => {
                            break (
                                SessionStatus::Failed,
                                Some("chunk_exhausted"),
                                Some(format!("chunk {} failed", index)),
                            );
                        }
                        ChunkOutcome::TimedOut => {
                            break (
                                SessionStatus::TimedOut,
                                Some("timeout"),
                                Some(format!("chunk {} exceeded the session budget", index)),
                            );
                        }
                        ChunkOutcome::Cancelled => {
                            break (SessionStatus::Cancelled, Some("cancelled"), None);
                        }
                        ChunkOutcome::StoreFailed => {
                            break (
                                SessionStatus::Failed,
                                Some("persistence_failure"),
                                Some(format!("chunk {} state could not be persisted", index)),
                            );
                        }
                    }
                }
            }
        };

        // Stop in-flight chunks and wait out a bounded grace period
        let _ = chunk_cancel_tx.send(true);
        let drain_deadline = Instant::now() + SHUTDOWN_GRACE;
        while in_flight > 0 {
            match tokio::time::timeout_at(drain_deadline, done_rx.recv()).await {
                Ok(Some(_)) => in_flight -= 1,
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        session_id = %self.session_id,
                        in_flight,
                        "Chunk tasks did not stop within the grace period"
                    );
                    break;
                }
            }
        }

        self.finalize(status, reason, error_msg.as_deref()).await
    }

    /// Cancel leftover chunk rows and write the terminal session state.
    async fn finalize(
        &self,
        status: SessionStatus,
        reason: Option<&str>,
        error_msg: Option<&str>,
    ) -> SessionStatus {
        if let Err(e) = self.store.cancel_open_chunks(&self.session_id).await {
            warn!(
                session_id = %self.session_id,
                error = %e,
                "Failed to cancel open chunk rows"
            );
        }

        match self.persist_terminal(status, reason, error_msg).await {
            Ok(true) => {
                self.record_event(EventRecord::session(
                    &self.session_id,
                    &format!("session_{}", status.as_str()),
                    error_msg.map(|s| s.to_string()),
                ))
                .await;
                info!(
                    session_id = %self.session_id,
                    status = status.as_str(),
                    reason = ?reason,
                    "Session reached terminal state"
                );
            }
            Ok(false) => {
                info!(
                    session_id = %self.session_id,
                    status = status.as_str(),
                    "Session was already finalized elsewhere"
                );
            }
            Err(e) => {
                error!(
                    session_id = %self.session_id,
                    status = status.as_str(),
                    error = %e,
                    "Failed to persist terminal session state"
                );
            }
        }

        status
    }

    async fn persist_running(&self, started_at: chrono::DateTime<Utc>) -> Result<(), CoreError> {
        let mut last_err = None;
        for _ in 0..=self.config.store_write_retries {
            match self.store.mark_session_running(&self.session_id, started_at).await {
                Ok(()) => return Ok(()),
                Err(e @ CoreError::InvalidSessionState { .. }) => return Err(e),
                Err(e @ CoreError::SessionNotFound { .. }) => return Err(e),
                Err(e) => {
                    debug!(
                        session_id = %self.session_id,
                        error = %e,
                        "Session state write failed, retrying"
                    );
                    last_err = Some(e);
                    tokio::time::sleep(STORE_RETRY_DELAY).await;
                }
            }
        }
        Err(last_err.expect("at least one write attempt"))
    }

    async fn persist_terminal(
        &self,
        status: SessionStatus,
        reason: Option<&str>,
        error_msg: Option<&str>,
    ) -> Result<bool, CoreError> {
        let mut last_err = None;
        for _ in 0..=self.config.store_write_retries {
            match self
                .store
                .complete_session_if_active(&self.session_id, status, reason, error_msg)
                .await
            {
                Ok(applied) => return Ok(applied),
                Err(e) => {
                    debug!(
                        session_id = %self.session_id,
                        error = %e,
                        "Terminal session write failed, retrying"
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
