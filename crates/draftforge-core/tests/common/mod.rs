// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for draftforge-core integration tests.
//!
//! Provides a scripted mock provider, a store wrapper that can be made to
//! fail chunk writes, and helpers for building orchestrators with tight
//! test budgets.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use draftforge_core::config::Config;
use draftforge_core::error::CoreError;
use draftforge_core::orchestrator::Orchestrator;
use draftforge_core::persistence::{MemoryStore, StateStore};
use draftforge_core::provider::{ChunkRequest, GeneratedChunk, ProviderClient, ProviderError};
use draftforge_core::session::{
    ChunkRecord, ChunkSpec, EventRecord, GenerationRequest, SessionRecord, SessionSnapshot,
    SessionStatus,
};

/// Scripted behavior for one chunk in the mock provider.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Return generated content immediately.
    Succeed,
    /// Always fail with a permanent error.
    FailPermanent,
    /// Always fail with a transient error.
    FailTransient,
    /// Fail transiently `failures` times, then succeed.
    TransientThenSucceed {
        /// Number of failures before the first success.
        failures: u32,
    },
    /// Always fail with a 429-equivalent carrying the given hint.
    RateLimited(Option<Duration>),
    /// Sleep for the given duration, then succeed.
    Delay(Duration),
    /// Sleep effectively forever (until deadline or cancellation).
    Hang,
}

/// One recorded provider call.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub session_id: String,
    pub chunk_index: u32,
    pub at: Instant,
}

/// Scripted provider for integration tests.
pub struct MockProvider {
    default: Behavior,
    per_chunk: Mutex<HashMap<u32, Behavior>>,
    calls: Mutex<Vec<CallRecord>>,
    failures_seen: Mutex<HashMap<(String, u32), u32>>,
}

impl MockProvider {
    pub fn new(default: Behavior) -> Self {
        Self {
            default,
            per_chunk: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            failures_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Override the behavior for one chunk index (across all sessions).
    pub fn with_chunk(self, index: u32, behavior: Behavior) -> Self {
        self.per_chunk.lock().unwrap().insert(index, behavior);
        self
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for_chunk(&self, index: u32) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.chunk_index == index)
            .count()
    }

    fn behavior_for(&self, index: u32) -> Behavior {
        self.per_chunk
            .lock()
            .unwrap()
            .get(&index)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    async fn generate(&self, request: &ChunkRequest) -> Result<GeneratedChunk, ProviderError> {
        self.calls.lock().unwrap().push(CallRecord {
            session_id: request.session_id.clone(),
            chunk_index: request.chunk_index,
            at: Instant::now(),
        });

        let content = format!("content for chunk {}", request.chunk_index);
        match self.behavior_for(request.chunk_index) {
            Behavior::Succeed => Ok(GeneratedChunk {
                content,
                tokens_used: Some(request.estimated_tokens),
            }),
            Behavior::FailPermanent => Err(ProviderError::Permanent {
                message: "content policy rejection".to_string(),
            }),
            Behavior::FailTransient => Err(ProviderError::Transient {
                message: "connection reset by peer".to_string(),
            }),
            Behavior::TransientThenSucceed { failures } => {
                let key = (request.session_id.clone(), request.chunk_index);
                let mut seen = self.failures_seen.lock().unwrap();
                let count = seen.entry(key).or_insert(0);
                if *count < failures {
                    *count += 1;
                    Err(ProviderError::Transient {
                        message: "upstream 503".to_string(),
                    })
                } else {
                    Ok(GeneratedChunk {
                        content,
                        tokens_used: Some(request.estimated_tokens),
                    })
                }
            }
            Behavior::RateLimited(retry_after) => Err(ProviderError::RateLimited {
                message: "too many requests".to_string(),
                retry_after,
            }),
            Behavior::Delay(duration) => {
                tokio::time::sleep(duration).await;
                Ok(GeneratedChunk {
                    content,
                    tokens_used: Some(request.estimated_tokens),
                })
            }
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(100_000)).await;
                Err(ProviderError::Transient {
                    message: "hang elapsed".to_string(),
                })
            }
        }
    }
}

/// Store wrapper whose chunk writes can be switched to fail, for
/// persistence-failure scenarios. Everything else delegates to the
/// wrapped in-memory store.
pub struct FlakyStore {
    inner: MemoryStore,
    fail_chunk_writes: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_chunk_writes: AtomicBool::new(false),
        }
    }

    pub fn fail_chunk_writes(&self, fail: bool) {
        self.fail_chunk_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn register_session(
        &self,
        session: &SessionRecord,
        chunks: &[ChunkRecord],
    ) -> Result<(), CoreError> {
        self.inner.register_session(session, chunks).await
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, CoreError> {
        self.inner.get_session(session_id).await
    }

    async fn mark_session_running(
        &self,
        session_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        self.inner.mark_session_running(session_id, started_at).await
    }

    async fn complete_session_if_active(
        &self,
        session_id: &str,
        status: SessionStatus,
        termination_reason: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool, CoreError> {
        self.inner
            .complete_session_if_active(session_id, status, termination_reason, error)
            .await
    }

    async fn update_chunk(&self, chunk: &ChunkRecord) -> Result<bool, CoreError> {
        if self.fail_chunk_writes.load(Ordering::SeqCst) {
            return Err(CoreError::DatabaseError {
                operation: "update_chunk".to_string(),
                details: "injected write failure".to_string(),
            });
        }
        self.inner.update_chunk(chunk).await
    }

    async fn list_chunks(&self, session_id: &str) -> Result<Vec<ChunkRecord>, CoreError> {
        self.inner.list_chunks(session_id).await
    }

    async fn cancel_open_chunks(&self, session_id: &str) -> Result<u64, CoreError> {
        self.inner.cancel_open_chunks(session_id).await
    }

    async fn list_active(&self) -> Result<Vec<String>, CoreError> {
        self.inner.list_active().await
    }

    async fn count_active(&self) -> Result<i64, CoreError> {
        self.inner.count_active().await
    }

    async fn insert_event(&self, event: &EventRecord) -> Result<(), CoreError> {
        self.inner.insert_event(event).await
    }

    async fn list_events(
        &self,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<EventRecord>, CoreError> {
        self.inner.list_events(session_id, limit).await
    }

    async fn get_terminal_sessions_older_than(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>, CoreError> {
        self.inner
            .get_terminal_sessions_older_than(older_than, limit)
            .await
    }

    async fn delete_sessions_batch(&self, session_ids: &[String]) -> Result<u64, CoreError> {
        self.inner.delete_sessions_batch(session_ids).await
    }

    async fn health_check(&self) -> Result<bool, CoreError> {
        self.inner.health_check().await
    }
}

/// Tight budgets so timing scenarios stay fast under paused time.
pub fn test_config() -> Config {
    Config {
        max_concurrent_sessions: 10,
        max_chunks_per_session: 4,
        generation_timeout: Duration::from_secs(300),
        max_retries_per_chunk: 2,
        calls_per_minute: 600,
        tokens_per_minute: 1_000_000,
        permit_acquire_timeout: Duration::from_secs(30),
        retry_backoff_base: Duration::from_millis(100),
        retry_backoff_cap: Duration::from_secs(1),
        store_write_retries: 2,
    }
}

/// Build an orchestrator over an in-memory store and the given provider.
pub fn orchestrator_with(
    config: Config,
    provider: Arc<MockProvider>,
) -> (Arc<Orchestrator>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(config),
        store.clone(),
        provider,
    ));
    (orchestrator, store)
}

/// Build a generation request with `chunks` equally-sized chunks.
pub fn request(chunks: usize) -> GenerationRequest {
    GenerationRequest {
        owner_context: "tenant-a".to_string(),
        chunks: (0..chunks)
            .map(|i| ChunkSpec {
                prompt: format!("write section {}", i),
                estimated_tokens: 100,
            })
            .collect(),
    }
}

/// Poll until the session reaches a terminal state.
///
/// Under paused time the 50ms poll cadence is what drives the clock, so the
/// iteration bound covers well past the longest test deadline.
pub async fn wait_for_terminal(orchestrator: &Orchestrator, session_id: &str) -> SessionSnapshot {
    for _ in 0..20_000 {
        let snapshot = orchestrator
            .poll(session_id)
            .await
            .expect("poll failed")
            .expect("session missing from store");
        if snapshot.status.is_terminal() {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("session {} never reached a terminal state", session_id);
}

/// Poll until the orchestrator has deregistered every session.
pub async fn wait_for_idle(orchestrator: &Orchestrator) {
    for _ in 0..20_000 {
        if orchestrator.active_sessions().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("orchestrator never went idle");
}

/// Initialize test logging once; safe to call from every test.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
