// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Draftforge Core - Generation Orchestrator
//!
//! This crate provides the orchestration engine for long-running AI
//! document-generation jobs. A job (session) is decomposed into ordered
//! chunks which are generated against a rate-limited external provider
//! under strict concurrency ceilings, with per-job and per-chunk state
//! tracked in a pluggable store and served through a poll-based status
//! contract.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                     Embedding Application                           │
//! │              (API layer: submit / poll / cancel)                    │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        Orchestrator                                 │
//! │     (admission control: at most max_concurrent_sessions active)     │
//! └─────────────────────────────────────────────────────────────────────┘
//!          │ spawns one per session                  │
//!          ▼                                         ▼
//! ┌───────────────────────┐                ┌─────────────────────────────┐
//! │  Session Scheduler    │   completes    │        State Store          │
//! │  (chunk slots, dead-  │───────────────►│  (memory / SQLite; polled   │
//! │   line, fail-fast)    │                │   snapshots live here)      │
//! └───────────────────────┘                └─────────────────────────────┘
//!          │ at most max_chunks_per_session in flight
//!          ▼
//! ┌───────────────────────┐                ┌─────────────────────────────┐
//! │   Chunk Executors     │──────────────► │        Rate Limiter         │
//! │  (retry, backoff,     │  permits       │  (calls/min + tokens/min,   │
//! │   attempt deadline)   │                │   process-wide)             │
//! └───────────────────────┘                └─────────────────────────────┘
//!          │
//!          ▼
//! ┌───────────────────────┐
//! │   Provider Client     │
//! │  (external AI API)    │
//! └───────────────────────┘
//! ```
//!
//! # Session State Machine
//!
//! ```text
//!                     ┌─────────┐
//!                     │ QUEUED  │
//!                     └────┬────┘
//!                          │ first chunk dispatch
//!                          ▼
//!                     ┌─────────┐
//!          ┌──────────│ RUNNING │──────────┬──────────┐
//!          │          └────┬────┘          │          │
//!          │               │               │          │
//!   all chunks        chunk retries    deadline    cancel
//!   succeeded         exhausted        exceeded    request
//!          │               │               │          │
//!          ▼               ▼               ▼          ▼
//!    ┌───────────┐    ┌────────┐    ┌───────────┐ ┌───────────┐
//!    │ COMPLETED │    │ FAILED │    │ TIMED_OUT │ │ CANCELLED │
//!    └───────────┘    └────────┘    └───────────┘ └───────────┘
//! ```
//!
//! Terminal states are final; re-submission requires a new session.
//! Fail-fast: the first chunk that exhausts its retries cancels the rest of
//! the session. A TimedOut session exposes no deliverable even when some
//! chunks succeeded.
//!
//! ## Status Descriptions
//!
//! | Status | Description |
//! |--------|-------------|
//! | `QUEUED` | Accepted by admission control, no chunk dispatched yet |
//! | `RUNNING` | Chunks are being dispatched and executed |
//! | `COMPLETED` | All chunks succeeded; the assembled result is available |
//! | `FAILED` | A chunk failed terminally, or durable state was lost |
//! | `TIMED_OUT` | The session exceeded its wall-clock budget |
//! | `CANCELLED` | The session was cancelled externally |
//!
//! # Configuration
//!
//! Configuration is loaded once from environment variables and never
//! re-read at runtime:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `DRAFTFORGE_MAX_CONCURRENT_SESSIONS` | `10` | Active-session ceiling |
//! | `DRAFTFORGE_MAX_CHUNKS_PER_SESSION` | `4` | Per-session chunk concurrency |
//! | `DRAFTFORGE_GENERATION_TIMEOUT_SECS` | `7200` | Session wall-clock budget |
//! | `DRAFTFORGE_MAX_RETRIES_PER_CHUNK` | `3` | Retry ceiling per chunk |
//! | `DRAFTFORGE_CALLS_PER_MINUTE` | `60` | Provider call budget |
//! | `DRAFTFORGE_TOKENS_PER_MINUTE` | `90000` | Provider token budget |
//! | `DRAFTFORGE_PERMIT_ACQUIRE_TIMEOUT_SECS` | `30` | Rate-limiter wait bound |
//! | `DRAFTFORGE_RETRY_BACKOFF_BASE_MS` | `1000` | Exponential backoff base |
//! | `DRAFTFORGE_RETRY_BACKOFF_CAP_SECS` | `60` | Backoff upper bound |
//! | `DRAFTFORGE_STORE_WRITE_RETRIES` | `3` | Store write retry bound |
//!
//! # Modules
//!
//! - [`config`]: Orchestrator configuration from environment variables
//! - [`error`]: Error types with stable error codes
//! - [`session`]: Session and chunk data model
//! - [`persistence`]: State-store abstraction, in-memory and SQLite backends
//! - [`limiter`]: Process-wide dual token bucket (calls + tokens)
//! - [`provider`]: Provider client interface and failure classification
//! - [`orchestrator`]: Admission control and the submit/poll/cancel surface
//! - [`runtime`]: Embeddable runtime with graceful shutdown
//! - [`retention`]: Background deletion of old terminal sessions

#![deny(missing_docs)]

/// Orchestrator configuration loaded from environment variables.
pub mod config;

/// Error types for orchestrator operations with stable error codes.
pub mod error;

/// Session and chunk data model, status state machines, poll snapshots.
pub mod session;

/// State-store abstraction with in-memory and SQLite backends.
pub mod persistence;

/// Process-wide provider rate limiter (calls/minute and tokens/minute).
pub mod limiter;

/// Provider client interface and classified failures.
pub mod provider;

/// Admission control and the caller-facing submit/poll/cancel surface.
pub mod orchestrator;

/// Embeddable runtime with builder and graceful shutdown.
pub mod runtime;

/// Background retention of terminal sessions.
pub mod retention;

pub(crate) mod executor;
pub(crate) mod scheduler;
