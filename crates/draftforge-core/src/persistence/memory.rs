//! In-memory state store, the reference implementation.
//!
//! Backs single-process deployments and tests. All maps live behind one
//! RwLock so a snapshot never interleaves with a concurrent writer.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::CoreError;
use crate::session::{ChunkRecord, ChunkStatus, EventRecord, SessionRecord, SessionStatus};

use super::StateStore;

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, SessionRecord>,
    chunks: HashMap<String, Vec<ChunkRecord>>,
    events: Vec<EventRecord>,
}

/// In-memory state store.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStore {
    async fn register_session(
        &self,
        session: &SessionRecord,
        chunks: &[ChunkRecord],
    ) -> Result<(), CoreError> {
        let mut inner = self.inner.write().await;
        if inner.sessions.contains_key(&session.session_id) {
            return Err(CoreError::ValidationError {
                field: "session_id".to_string(),
                message: format!("session '{}' already exists", session.session_id),
            });
        }
        inner
            .sessions
            .insert(session.session_id.clone(), session.clone());
        inner
            .chunks
            .insert(session.session_id.clone(), chunks.to_vec());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, CoreError> {
        Ok(self.inner.read().await.sessions.get(session_id).cloned())
    }

    async fn mark_session_running(
        &self,
        session_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.sessions.get_mut(session_id) else {
            return Err(CoreError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        };
        if session.status != SessionStatus::Queued {
            return Err(CoreError::InvalidSessionState {
                session_id: session_id.to_string(),
                expected: SessionStatus::Queued.as_str().to_string(),
                actual: session.status.as_str().to_string(),
            });
        }
        session.status = SessionStatus::Running;
        session.started_at = Some(started_at);
        Ok(())
    }

    async fn complete_session_if_active(
        &self,
        session_id: &str,
        status: SessionStatus,
        termination_reason: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool, CoreError> {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.sessions.get_mut(session_id) else {
            return Err(CoreError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        };
        if !session.status.is_active() {
            return Ok(false);
        }
        session.status = status;
        session.finished_at = Some(Utc::now());
        session.termination_reason = termination_reason.map(|s| s.to_string());
        session.error = error.map(|s| s.to_string());
        Ok(true)
    }

    async fn update_chunk(&self, chunk: &ChunkRecord) -> Result<bool, CoreError> {
        let mut inner = self.inner.write().await;
        let Some(chunks) = inner.chunks.get_mut(&chunk.session_id) else {
            return Err(CoreError::SessionNotFound {
                session_id: chunk.session_id.clone(),
            });
        };
        let Some(existing) = chunks.iter_mut().find(|c| c.index == chunk.index) else {
            return Err(CoreError::ValidationError {
                field: "index".to_string(),
                message: format!(
                    "chunk {} not registered for session '{}'",
                    chunk.index, chunk.session_id
                ),
            });
        };
        if existing.status.is_terminal() {
            return Ok(false);
        }
        *existing = chunk.clone();
        Ok(true)
    }

    async fn list_chunks(&self, session_id: &str) -> Result<Vec<ChunkRecord>, CoreError> {
        let inner = self.inner.read().await;
        let mut chunks = inner.chunks.get(session_id).cloned().unwrap_or_default();
        chunks.sort_by_key(|c| c.index);
        Ok(chunks)
    }

    async fn cancel_open_chunks(&self, session_id: &str) -> Result<u64, CoreError> {
        let mut inner = self.inner.write().await;
        let Some(chunks) = inner.chunks.get_mut(session_id) else {
            return Ok(0);
        };
        let mut cancelled = 0u64;
        for chunk in chunks.iter_mut() {
            if !chunk.status.is_terminal() {
                chunk.status = ChunkStatus::Cancelled;
                chunk.updated_at = Utc::now();
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn list_active(&self) -> Result<Vec<String>, CoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .sessions
            .values()
            .filter(|s| s.status.is_active())
            .map(|s| s.session_id.clone())
            .collect())
    }

    async fn count_active(&self) -> Result<i64, CoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .sessions
            .values()
            .filter(|s| s.status.is_active())
            .count() as i64)
    }

    async fn insert_event(&self, event: &EventRecord) -> Result<(), CoreError> {
        self.inner.write().await.events.push(event.clone());
        Ok(())
    }

    async fn list_events(
        &self,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<EventRecord>, CoreError> {
        let inner = self.inner.read().await;
        let mut events: Vec<EventRecord> = inner
            .events
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect();
        events.reverse();
        events.truncate(limit.max(0) as usize);
        Ok(events)
    }

    async fn get_terminal_sessions_older_than(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>, CoreError> {
        let inner = self.inner.read().await;
        let mut terminal: Vec<(&DateTime<Utc>, &String)> = inner
            .sessions
            .values()
            .filter(|s| s.status.is_terminal())
            .filter_map(|s| {
                s.finished_at
                    .as_ref()
                    .filter(|t| **t < older_than)
                    .map(|t| (t, &s.session_id))
            })
            .collect();
        terminal.sort_by_key(|(t, _)| **t);
        Ok(terminal
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|(_, id)| id.clone())
            .collect())
    }

    async fn delete_sessions_batch(&self, session_ids: &[String]) -> Result<u64, CoreError> {
        let mut inner = self.inner.write().await;
        let mut deleted = 0u64;
        for id in session_ids {
            if inner.sessions.remove(id).is_some() {
                inner.chunks.remove(id);
                deleted += 1;
            }
        }
        inner
            .events
            .retain(|e| !session_ids.contains(&e.session_id));
        Ok(deleted)
    }

    async fn health_check(&self) -> Result<bool, CoreError> {
        Ok(true)
    }
}
