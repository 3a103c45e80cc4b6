// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestrator: admission control and the caller-facing surface.
//!
//! The orchestrator is the process-wide gatekeeper. It bounds the number of
//! concurrently active sessions, spawns one scheduler task per accepted
//! session, and serves the poll/cancel contract consumed by the embedding
//! API layer. Capacity is checked atomically under the registry lock, so
//! admission is first-come-first-served per request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::error::CoreError;
use crate::executor::ChunkExecutor;
use crate::limiter::RateLimiter;
use crate::persistence::StateStore;
use crate::provider::ProviderClient;
use crate::scheduler::SessionScheduler;
use crate::session::{
    ChunkRecord, GenerationRequest, SessionRecord, SessionSnapshot, SessionStatus,
};

/// How long `shutdown` waits for cancelled sessions to persist their
/// terminal state before giving up.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(10);

struct SessionHandle {
    cancel_tx: watch::Sender<bool>,
}

/// Process-wide generation orchestrator.
///
/// Shared behind an `Arc`; all methods take `&self`.
pub struct Orchestrator {
    config: Arc<Config>,
    store: Arc<dyn StateStore>,
    executor: Arc<ChunkExecutor>,
    registry: Arc<Mutex<HashMap<String, SessionHandle>>>,
}

impl Orchestrator {
    /// Create an orchestrator over the given store and provider client.
    ///
    /// The rate limiter is built from the configuration and shared by every
    /// chunk executor across all sessions.
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn StateStore>,
        provider: Arc<dyn ProviderClient>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            config.calls_per_minute,
            config.tokens_per_minute,
        ));
        let executor = Arc::new(ChunkExecutor::new(
            store.clone(),
            provider,
            limiter,
            config.clone(),
        ));
        Self {
            config,
            store,
            executor,
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Submit a generation request.
    ///
    /// Returns the new session ID, or `CapacityExceeded` synchronously when
    /// the process is at its session ceiling. Over-capacity requests are
    /// never queued and the state store is not touched.
    #[instrument(skip(self, request), fields(owner_context = %request.owner_context))]
    pub async fn submit(&self, request: GenerationRequest) -> Result<String, CoreError> {
        if request.chunks.is_empty() {
            return Err(CoreError::ValidationError {
                field: "chunks".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if let Some(pos) = request.chunks.iter().position(|c| c.prompt.is_empty()) {
            return Err(CoreError::ValidationError {
                field: "chunks".to_string(),
                message: format!("chunk {} has an empty prompt", pos),
            });
        }

        // The registry lock is held across registration so the capacity
        // check and the insert are one atomic admission decision.
        let mut registry = self.registry.lock().await;
        let active = registry.len();
        if active >= self.config.max_concurrent_sessions {
            debug!(active, limit = self.config.max_concurrent_sessions, "Admission refused");
            return Err(CoreError::CapacityExceeded {
                active,
                limit: self.config.max_concurrent_sessions,
            });
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let session = SessionRecord {
            session_id: session_id.clone(),
            owner_context: request.owner_context.clone(),
            status: SessionStatus::Queued,
            chunk_count: request.chunks.len() as u32,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            termination_reason: None,
        };
        let chunks: Vec<ChunkRecord> = request
            .chunks
            .iter()
            .enumerate()
            .map(|(i, spec)| ChunkRecord::pending(&session_id, i as u32, spec))
            .collect();

        self.store.register_session(&session, &chunks).await?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        registry.insert(session_id.clone(), SessionHandle { cancel_tx });
        drop(registry);

        let deadline = Instant::now() + self.config.generation_timeout;
        let scheduler = SessionScheduler::new(
            session_id.clone(),
            request.owner_context,
            chunks,
            self.config.clone(),
            self.store.clone(),
            self.executor.clone(),
            cancel_rx,
            deadline,
        );

        let registry = self.registry.clone();
        let task_session_id = session_id.clone();
        tokio::spawn(async move {
            let status = scheduler.run().await;
            // Deregistered exactly once, on the terminal transition
            registry.lock().await.remove(&task_session_id);
            debug!(
                session_id = %task_session_id,
                status = status.as_str(),
                "Session deregistered"
            );
        });

        info!(
            session_id = %session_id,
            active = active + 1,
            "Session admitted"
        );
        Ok(session_id)
    }

    /// Return the latest snapshot for a session, without blocking on
    /// completion. Safe to call at any cadence; terminal sessions return
    /// the same snapshot on every call.
    #[instrument(skip(self))]
    pub async fn poll(&self, session_id: &str) -> Result<Option<SessionSnapshot>, CoreError> {
        self.store.load_snapshot(session_id).await
    }

    /// Request cancellation of a session.
    ///
    /// Best-effort: in-flight provider calls are abandoned rather than
    /// aborted. Returns true if the session was still active and the signal
    /// was delivered, false if it had already reached a terminal state.
    #[instrument(skip(self))]
    pub async fn cancel(&self, session_id: &str) -> Result<bool, CoreError> {
        let registry = self.registry.lock().await;
        if let Some(handle) = registry.get(session_id) {
            let _ = handle.cancel_tx.send(true);
            info!(session_id, "Cancellation requested");
            return Ok(true);
        }
        drop(registry);

        // Not active: distinguish terminal sessions from unknown IDs
        match self.store.get_session(session_id).await? {
            Some(_) => Ok(false),
            None => Err(CoreError::SessionNotFound {
                session_id: session_id.to_string(),
            }),
        }
    }

    /// Number of sessions currently registered with a live scheduler.
    pub async fn active_sessions(&self) -> usize {
        self.registry.lock().await.len()
    }

    /// Fail sessions left Queued/Running in the store with no live
    /// scheduler.
    ///
    /// Called once at startup: a session found active after a restart has
    /// lost its scheduler and cannot make progress, so it is failed as
    /// orphaned rather than silently resumed. Returns the number of
    /// sessions transitioned.
    pub async fn recover_orphaned_sessions(&self) -> Result<u64, CoreError> {
        let active_ids = self.store.list_active().await?;
        if active_ids.is_empty() {
            return Ok(0);
        }

        let registry = self.registry.lock().await;
        let orphaned: Vec<String> = active_ids
            .into_iter()
            .filter(|id| !registry.contains_key(id))
            .collect();
        drop(registry);

        let mut recovered = 0u64;
        for session_id in orphaned {
            warn!(
                session_id = %session_id,
                "Failing session orphaned by restart"
            );
            if let Err(e) = self.store.cancel_open_chunks(&session_id).await {
                warn!(
                    session_id = %session_id,
                    error = %e,
                    "Failed to cancel open chunk rows of orphaned session"
                );
            }
            let applied = self
                .store
                .complete_session_if_active(
                    &session_id,
                    SessionStatus::Failed,
                    Some("orphaned"),
                    Some("orphaned on restart: no scheduler owns this session"),
                )
                .await?;
            if applied {
                recovered += 1;
            }
        }

        if recovered > 0 {
            info!(recovered, "Orphaned sessions failed on startup");
        }
        Ok(recovered)
    }

    /// Cancel every active session and wait for schedulers to persist
    /// terminal state, bounded by a grace period.
    pub(crate) async fn shutdown(&self) {
        let registry = self.registry.lock().await;
        let active = registry.len();
        for handle in registry.values() {
            let _ = handle.cancel_tx.send(true);
        }
        drop(registry);

        if active == 0 {
            return;
        }
        info!(active, "Cancelling active sessions for shutdown");

        let deadline = Instant::now() + SHUTDOWN_WAIT;
        loop {
            if self.registry.lock().await.is_empty() {
                return;
            }
            if Instant::now() >= deadline {
                warn!("Sessions still active after shutdown grace period");
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
