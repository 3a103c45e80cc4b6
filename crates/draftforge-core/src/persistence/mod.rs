//! Persistence interfaces and backends for draftforge-core.
//!
//! This module defines the state-store abstraction and backend
//! implementations. The store is the only component with external
//! persistence; every state transition is awaited here before it becomes
//! externally visible through the poll contract.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::session::{
    ChunkRecord, ChunkProgress, EventRecord, SessionRecord, SessionSnapshot, SessionStatus,
};

/// State-store interface used by the orchestrator, scheduler, and executors.
///
/// Implementations must guarantee:
/// - a write acknowledged with `Ok` is durable for that backend,
/// - `load_snapshot` never returns state older than the last acknowledged
///   write,
/// - terminal session and chunk rows are never overwritten (monotonic
///   state machine, enforced on write).
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Register a new session together with its Pending chunk rows.
    async fn register_session(
        &self,
        session: &SessionRecord,
        chunks: &[ChunkRecord],
    ) -> Result<(), CoreError>;

    /// Load a single session record.
    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, CoreError>;

    /// Transition a Queued session to Running, recording the dispatch time.
    async fn mark_session_running(
        &self,
        session_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    /// Write a terminal status, but only if the session is still active.
    ///
    /// This is the guard against racing terminal writers (scheduler vs.
    /// orphan recovery): the first terminal write wins and later ones are
    /// skipped. Returns true if the update was applied.
    async fn complete_session_if_active(
        &self,
        session_id: &str,
        status: SessionStatus,
        termination_reason: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool, CoreError>;

    /// Upsert a chunk row.
    ///
    /// Writes to a chunk that is already terminal are skipped (late results
    /// from abandoned provider calls are discarded). Returns true if the
    /// update was applied.
    async fn update_chunk(&self, chunk: &ChunkRecord) -> Result<bool, CoreError>;

    /// Load all chunk rows of a session, index-ascending.
    async fn list_chunks(&self, session_id: &str) -> Result<Vec<ChunkRecord>, CoreError>;

    /// Mark every non-terminal chunk of a session Cancelled.
    ///
    /// Returns the number of chunks transitioned.
    async fn cancel_open_chunks(&self, session_id: &str) -> Result<u64, CoreError>;

    /// List the IDs of sessions currently in Queued or Running.
    async fn list_active(&self) -> Result<Vec<String>, CoreError>;

    /// Count sessions currently in Queued or Running.
    async fn count_active(&self) -> Result<i64, CoreError>;

    /// Append an audit event. Best-effort from the caller's perspective;
    /// an event failure never fails the transition it describes.
    async fn insert_event(&self, event: &EventRecord) -> Result<(), CoreError>;

    /// List the most recent events of a session, newest first.
    async fn list_events(
        &self,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<EventRecord>, CoreError>;

    /// Get terminal session IDs whose terminal transition is older than
    /// the given cutoff, oldest first, for batch retention.
    async fn get_terminal_sessions_older_than(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>, CoreError>;

    /// Delete sessions (with their chunks and events) by ID.
    ///
    /// Returns the count of deleted sessions.
    async fn delete_sessions_batch(&self, session_ids: &[String]) -> Result<u64, CoreError>;

    /// Check backend health.
    async fn health_check(&self) -> Result<bool, CoreError>;

    /// Assemble the poll snapshot for a session.
    ///
    /// The deliverable (`result`) is exposed only for Completed sessions;
    /// a TimedOut or Cancelled session returns no result even when some
    /// chunks succeeded.
    async fn load_snapshot(&self, session_id: &str) -> Result<Option<SessionSnapshot>, CoreError> {
        let Some(session) = self.get_session(session_id).await? else {
            return Ok(None);
        };
        let chunks = self.list_chunks(session_id).await?;

        let result = if session.status == SessionStatus::Completed {
            Some(
                chunks
                    .iter()
                    .map(|c| c.output.clone().unwrap_or_default())
                    .collect(),
            )
        } else {
            None
        };

        let progress: Vec<ChunkProgress> = chunks
            .iter()
            .map(|c| ChunkProgress {
                index: c.index,
                status: c.status,
                attempt: c.attempt,
                error: c.error.clone(),
            })
            .collect();

        Ok(Some(SessionSnapshot {
            session_id: session.session_id,
            owner_context: session.owner_context,
            status: session.status,
            created_at: session.created_at,
            finished_at: session.finished_at,
            chunks: progress,
            result,
            error: session.error,
            termination_reason: session.termination_reason,
        }))
    }
}
