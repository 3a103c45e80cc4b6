// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for cleaning up old terminal sessions.
//!
//! Terminal sessions are not deleted immediately: the poll contract keeps
//! serving the terminal snapshot so slow callers can still observe the
//! outcome. Instead, this worker periodically deletes sessions whose
//! terminal transition is older than the configured age, together with
//! their chunks and events.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::persistence::StateStore;

/// Configuration for the retention worker.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// How often to scan for old sessions.
    pub poll_interval: Duration,
    /// Maximum age of a terminal session before deletion.
    pub max_age: Duration,
    /// Maximum sessions deleted per scan.
    pub batch_limit: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3600), // 1 hour
            max_age: Duration::from_secs(7 * 24 * 3600), // 7 days
            batch_limit: 100,
        }
    }
}

/// Background worker that deletes old terminal sessions.
pub struct RetentionWorker {
    store: Arc<dyn StateStore>,
    config: RetentionConfig,
    shutdown: Arc<Notify>,
}

impl RetentionWorker {
    /// Create a new retention worker.
    pub fn new(store: Arc<dyn StateStore>, config: RetentionConfig) -> Self {
        Self {
            store,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the retention loop.
    ///
    /// Periodically deletes old terminal sessions. The loop exits when the
    /// shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_age_hours = self.config.max_age.as_secs() / 3600,
            "Retention worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Retention worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.cleanup_old_sessions().await {
                        error!(error = %e, "Failed to clean up old sessions");
                    }
                }
            }
        }

        info!("Retention worker stopped");
    }

    /// Delete one batch of terminal sessions older than the cutoff.
    async fn cleanup_old_sessions(&self) -> crate::error::Result<()> {
        let cutoff = chrono::Duration::from_std(self.config.max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let Some(cutoff) = cutoff else {
            debug!("Retention cutoff out of range, skipping cycle");
            return Ok(());
        };

        let old_ids = self
            .store
            .get_terminal_sessions_older_than(cutoff, self.config.batch_limit)
            .await?;

        if old_ids.is_empty() {
            debug!("Retention cycle completed, no old sessions found");
            return Ok(());
        }

        let deleted = self.store.delete_sessions_batch(&old_ids).await?;
        info!(deleted, "Retention cycle completed");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemoryStore, StateStore};
    use crate::session::{ChunkRecord, ChunkSpec, SessionRecord, SessionStatus};

    #[test]
    fn test_config_default() {
        let config = RetentionConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(3600));
        assert_eq!(config.max_age, Duration::from_secs(7 * 24 * 3600));
        assert_eq!(config.batch_limit, 100);
    }

    #[test]
    fn test_shutdown_handle() {
        let worker = RetentionWorker::new(
            Arc::new(MemoryStore::new()),
            RetentionConfig::default(),
        );
        let handle = worker.shutdown_handle();
        assert!(Arc::strong_count(&handle) >= 2);
    }

    #[tokio::test]
    async fn test_cleanup_deletes_only_old_terminal_sessions() {
        let store = Arc::new(MemoryStore::new());

        for id in ["done", "active"] {
            let session = SessionRecord {
                session_id: id.to_string(),
                owner_context: "tenant-a".to_string(),
                status: SessionStatus::Queued,
                chunk_count: 1,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
                error: None,
                termination_reason: None,
            };
            let chunks = vec![ChunkRecord::pending(
                id,
                0,
                &ChunkSpec {
                    prompt: "p".to_string(),
                    estimated_tokens: 10,
                },
            )];
            store.register_session(&session, &chunks).await.unwrap();
        }
        store
            .complete_session_if_active("done", SessionStatus::Completed, None, None)
            .await
            .unwrap();

        // max_age of zero makes the just-finished session eligible
        let worker = RetentionWorker::new(
            store.clone(),
            RetentionConfig {
                poll_interval: Duration::from_secs(1),
                max_age: Duration::ZERO,
                batch_limit: 100,
            },
        );
        // finished_at must be strictly older than the cutoff
        tokio::time::sleep(Duration::from_millis(5)).await;
        worker.cleanup_old_sessions().await.unwrap();

        assert!(store.get_session("done").await.unwrap().is_none());
        assert!(store.get_session("active").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cleanup_empty_store() {
        let worker = RetentionWorker::new(
            Arc::new(MemoryStore::new()),
            RetentionConfig::default(),
        );
        assert!(worker.cleanup_old_sessions().await.is_ok());
    }
}
