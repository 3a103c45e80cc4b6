// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.
//!
//! Loaded once at process start and shared by reference; no component
//! re-reads the environment at runtime.

use std::time::Duration;

/// Orchestrator configuration.
///
/// Immutable after load. Every component receives it behind an `Arc` at
/// construction time.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of sessions in Queued or Running at once.
    pub max_concurrent_sessions: usize,
    /// Maximum number of chunks of a single session running concurrently.
    pub max_chunks_per_session: usize,
    /// Wall-clock budget for a whole session, measured from creation.
    pub generation_timeout: Duration,
    /// Retry ceiling per chunk; a chunk makes at most `max_retries_per_chunk + 1` attempts.
    pub max_retries_per_chunk: u32,
    /// Provider call budget per minute, shared process-wide.
    pub calls_per_minute: u32,
    /// Provider token budget per minute, shared process-wide.
    pub tokens_per_minute: u64,
    /// How long a chunk executor waits for a rate-limiter permit before
    /// treating the attempt as a transient failure.
    pub permit_acquire_timeout: Duration,
    /// Base delay for exponential retry backoff (doubles per attempt).
    pub retry_backoff_base: Duration,
    /// Upper bound on a single backoff delay.
    pub retry_backoff_cap: Duration,
    /// How many times a failed state-store write is retried before the
    /// session is failed with a persistence error.
    pub store_write_retries: u32,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional, with defaults matching the documented
    /// production limits:
    /// - `DRAFTFORGE_MAX_CONCURRENT_SESSIONS`: default 10
    /// - `DRAFTFORGE_MAX_CHUNKS_PER_SESSION`: default 4
    /// - `DRAFTFORGE_GENERATION_TIMEOUT_SECS`: default 7200 (120 minutes)
    /// - `DRAFTFORGE_MAX_RETRIES_PER_CHUNK`: default 3
    /// - `DRAFTFORGE_CALLS_PER_MINUTE`: default 60
    /// - `DRAFTFORGE_TOKENS_PER_MINUTE`: default 90000
    /// - `DRAFTFORGE_PERMIT_ACQUIRE_TIMEOUT_SECS`: default 30
    /// - `DRAFTFORGE_RETRY_BACKOFF_BASE_MS`: default 1000
    /// - `DRAFTFORGE_RETRY_BACKOFF_CAP_SECS`: default 60
    /// - `DRAFTFORGE_STORE_WRITE_RETRIES`: default 3
    pub fn from_env() -> Result<Self, ConfigError> {
        let max_concurrent_sessions: usize =
            parse_var("DRAFTFORGE_MAX_CONCURRENT_SESSIONS", "10")?;
        if max_concurrent_sessions == 0 {
            return Err(ConfigError::Invalid(
                "DRAFTFORGE_MAX_CONCURRENT_SESSIONS",
                "must be at least 1",
            ));
        }

        let max_chunks_per_session: usize = parse_var("DRAFTFORGE_MAX_CHUNKS_PER_SESSION", "4")?;
        if max_chunks_per_session == 0 {
            return Err(ConfigError::Invalid(
                "DRAFTFORGE_MAX_CHUNKS_PER_SESSION",
                "must be at least 1",
            ));
        }

        let generation_timeout_secs: u64 =
            parse_var("DRAFTFORGE_GENERATION_TIMEOUT_SECS", "7200")?;
        let max_retries_per_chunk: u32 = parse_var("DRAFTFORGE_MAX_RETRIES_PER_CHUNK", "3")?;

        let calls_per_minute: u32 = parse_var("DRAFTFORGE_CALLS_PER_MINUTE", "60")?;
        if calls_per_minute == 0 {
            return Err(ConfigError::Invalid(
                "DRAFTFORGE_CALLS_PER_MINUTE",
                "must be at least 1",
            ));
        }

        let tokens_per_minute: u64 = parse_var("DRAFTFORGE_TOKENS_PER_MINUTE", "90000")?;
        if tokens_per_minute == 0 {
            return Err(ConfigError::Invalid(
                "DRAFTFORGE_TOKENS_PER_MINUTE",
                "must be at least 1",
            ));
        }

        let permit_acquire_timeout_secs: u64 =
            parse_var("DRAFTFORGE_PERMIT_ACQUIRE_TIMEOUT_SECS", "30")?;
        let retry_backoff_base_ms: u64 = parse_var("DRAFTFORGE_RETRY_BACKOFF_BASE_MS", "1000")?;
        let retry_backoff_cap_secs: u64 = parse_var("DRAFTFORGE_RETRY_BACKOFF_CAP_SECS", "60")?;
        let store_write_retries: u32 = parse_var("DRAFTFORGE_STORE_WRITE_RETRIES", "3")?;

        Ok(Self {
            max_concurrent_sessions,
            max_chunks_per_session,
            generation_timeout: Duration::from_secs(generation_timeout_secs),
            max_retries_per_chunk,
            calls_per_minute,
            tokens_per_minute,
            permit_acquire_timeout: Duration::from_secs(permit_acquire_timeout_secs),
            retry_backoff_base: Duration::from_millis(retry_backoff_base_ms),
            retry_backoff_cap: Duration::from_secs(retry_backoff_cap_secs),
            store_write_retries,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 10,
            max_chunks_per_session: 4,
            generation_timeout: Duration::from_secs(7200),
            max_retries_per_chunk: 3,
            calls_per_minute: 60,
            tokens_per_minute: 90_000,
            permit_acquire_timeout: Duration::from_secs(30),
            retry_backoff_base: Duration::from_millis(1000),
            retry_backoff_cap: Duration::from_secs(60),
            store_write_retries: 3,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: &str) -> Result<T, ConfigError> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(name, "must be a non-negative integer"))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
