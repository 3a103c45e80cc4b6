//! SQLite-backed state store implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};

use crate::error::CoreError;
use crate::session::{
    ChunkRecord, ChunkStatus, EventRecord, SessionRecord, SessionStatus,
};

use super::StateStore;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

const ACTIVE_STATUSES: &str = "('queued', 'running')";
const TERMINAL_CHUNK_STATUSES: &str = "('succeeded', 'failed', 'timed_out', 'cancelled')";

/// SQLite-backed state store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new SQLite store from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite store from a file path.
    ///
    /// This convenience constructor handles all setup:
    /// - Creates parent directories if they don't exist
    /// - Creates the database file if it doesn't exist
    /// - Connects to the database with sensible defaults
    /// - Runs all migrations
    ///
    /// # Example
    ///
    /// ```ignore
    /// let store = SqliteStore::from_path(".data/draftforge.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let path_str = path.to_string_lossy();
        let url = format!("sqlite:{}?mode=rwc", path_str);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }
}

fn parse_session_status(s: &str) -> Result<SessionStatus, CoreError> {
    SessionStatus::parse(s).ok_or_else(|| CoreError::DatabaseError {
        operation: "decode".to_string(),
        details: format!("unknown session status '{}'", s),
    })
}

fn parse_chunk_status(s: &str) -> Result<ChunkStatus, CoreError> {
    ChunkStatus::parse(s).ok_or_else(|| CoreError::DatabaseError {
        operation: "decode".to_string(),
        details: format!("unknown chunk status '{}'", s),
    })
}

fn session_from_row(row: &SqliteRow) -> Result<SessionRecord, CoreError> {
    Ok(SessionRecord {
        session_id: row.get("session_id"),
        owner_context: row.get("owner_context"),
        status: parse_session_status(row.get::<String, _>("status").as_str())?,
        chunk_count: row.get::<i64, _>("chunk_count") as u32,
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        error: row.get("error"),
        termination_reason: row.get("termination_reason"),
    })
}

fn chunk_from_row(row: &SqliteRow) -> Result<ChunkRecord, CoreError> {
    Ok(ChunkRecord {
        session_id: row.get("session_id"),
        index: row.get::<i64, _>("chunk_index") as u32,
        status: parse_chunk_status(row.get::<String, _>("status").as_str())?,
        attempt: row.get::<i64, _>("attempt") as u32,
        prompt: row.get("prompt"),
        estimated_tokens: row.get::<i64, _>("estimated_tokens") as u32,
        output: row.get("output"),
        error: row.get("error"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait::async_trait]
impl StateStore for SqliteStore {
    async fn register_session(
        &self,
        session: &SessionRecord,
        chunks: &[ChunkRecord],
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, owner_context, status, chunk_count,
                                  created_at, started_at, finished_at, error, termination_reason)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.session_id)
        .bind(&session.owner_context)
        .bind(session.status.as_str())
        .bind(session.chunk_count as i64)
        .bind(session.created_at)
        .bind(session.started_at)
        .bind(session.finished_at)
        .bind(&session.error)
        .bind(&session.termination_reason)
        .execute(&mut *tx)
        .await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (session_id, chunk_index, status, attempt, prompt,
                                    estimated_tokens, output, error, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.session_id)
            .bind(chunk.index as i64)
            .bind(chunk.status.as_str())
            .bind(chunk.attempt as i64)
            .bind(&chunk.prompt)
            .bind(chunk.estimated_tokens as i64)
            .bind(&chunk.output)
            .bind(&chunk.error)
            .bind(chunk.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, CoreError> {
        let row = sqlx::query(
            r#"
            SELECT session_id, owner_context, status, chunk_count,
                   created_at, started_at, finished_at, error, termination_reason
            FROM sessions
            WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| session_from_row(&r)).transpose()
    }

    async fn mark_session_running(
        &self,
        session_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET status = 'running', started_at = ?
            WHERE session_id = ? AND status = 'queued'
            "#,
        )
        .bind(started_at)
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get_session(session_id).await? {
                Some(session) => Err(CoreError::InvalidSessionState {
                    session_id: session_id.to_string(),
                    expected: SessionStatus::Queued.as_str().to_string(),
                    actual: session.status.as_str().to_string(),
                }),
                None => Err(CoreError::SessionNotFound {
                    session_id: session_id.to_string(),
                }),
            };
        }
        Ok(())
    }

    async fn complete_session_if_active(
        &self,
        session_id: &str,
        status: SessionStatus,
        termination_reason: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE sessions
            SET status = ?1,
                finished_at = ?2,
                termination_reason = ?3,
                error = ?4
            WHERE session_id = ?5
              AND status IN {ACTIVE_STATUSES}
            "#
        ))
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(termination_reason)
        .bind(error)
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if self.get_session(session_id).await?.is_none() {
            return Err(CoreError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        }
        Ok(false)
    }

    async fn update_chunk(&self, chunk: &ChunkRecord) -> Result<bool, CoreError> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE chunks
            SET status = ?1, attempt = ?2, output = ?3, error = ?4, updated_at = ?5
            WHERE session_id = ?6 AND chunk_index = ?7
              AND status NOT IN {TERMINAL_CHUNK_STATUSES}
            "#
        ))
        .bind(chunk.status.as_str())
        .bind(chunk.attempt as i64)
        .bind(&chunk.output)
        .bind(&chunk.error)
        .bind(chunk.updated_at)
        .bind(&chunk.session_id)
        .bind(chunk.index as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists: Option<(i64,)> = sqlx::query_as(
            r#"SELECT 1 FROM chunks WHERE session_id = ? AND chunk_index = ?"#,
        )
        .bind(&chunk.session_id)
        .bind(chunk.index as i64)
        .fetch_optional(&self.pool)
        .await?;

        if exists.is_none() {
            return Err(CoreError::ValidationError {
                field: "index".to_string(),
                message: format!(
                    "chunk {} not registered for session '{}'",
                    chunk.index, chunk.session_id
                ),
            });
        }
        Ok(false)
    }

    async fn list_chunks(&self, session_id: &str) -> Result<Vec<ChunkRecord>, CoreError> {
        let rows = sqlx::query(
            r#"
            SELECT session_id, chunk_index, status, attempt, prompt,
                   estimated_tokens, output, error, updated_at
            FROM chunks
            WHERE session_id = ?
            ORDER BY chunk_index ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(chunk_from_row).collect()
    }

    async fn cancel_open_chunks(&self, session_id: &str) -> Result<u64, CoreError> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE chunks
            SET status = 'cancelled', updated_at = ?1
            WHERE session_id = ?2
              AND status NOT IN {TERMINAL_CHUNK_STATUSES}
            "#
        ))
        .bind(Utc::now())
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn list_active(&self) -> Result<Vec<String>, CoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(&format!(
            r#"SELECT session_id FROM sessions WHERE status IN {ACTIVE_STATUSES}"#
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn count_active(&self) -> Result<i64, CoreError> {
        let row: (i64,) = sqlx::query_as(&format!(
            r#"SELECT COUNT(*) FROM sessions WHERE status IN {ACTIVE_STATUSES}"#
        ))
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    async fn insert_event(&self, event: &EventRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO session_events (session_id, event_type, chunk_index, detail, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.session_id)
        .bind(&event.event_type)
        .bind(event.chunk_index.map(|i| i as i64))
        .bind(&event.detail)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_events(
        &self,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<EventRecord>, CoreError> {
        let rows = sqlx::query(
            r#"
            SELECT session_id, event_type, chunk_index, detail, created_at
            FROM session_events
            WHERE session_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| EventRecord {
                session_id: row.get("session_id"),
                event_type: row.get("event_type"),
                chunk_index: row.get::<Option<i64>, _>("chunk_index").map(|i| i as u32),
                detail: row.get("detail"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn get_terminal_sessions_older_than(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>, CoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(&format!(
            r#"
            SELECT session_id FROM sessions
            WHERE status NOT IN {ACTIVE_STATUSES}
              AND finished_at IS NOT NULL
              AND finished_at < ?
            ORDER BY finished_at ASC
            LIMIT ?
            "#
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn delete_sessions_batch(&self, session_ids: &[String]) -> Result<u64, CoreError> {
        let mut deleted = 0u64;
        let mut tx = self.pool.begin().await?;

        for session_id in session_ids {
            sqlx::query("DELETE FROM session_events WHERE session_id = ?")
                .bind(session_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM chunks WHERE session_id = ?")
                .bind(session_id)
                .execute(&mut *tx)
                .await?;
            let result = sqlx::query("DELETE FROM sessions WHERE session_id = ?")
                .bind(session_id)
                .execute(&mut *tx)
                .await?;
            deleted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(deleted)
    }

    async fn health_check(&self) -> Result<bool, CoreError> {
        let row: (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }
}
