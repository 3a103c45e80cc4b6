// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session and chunk data model.
//!
//! A generation session is one end-to-end document job composed of ordered
//! chunks. Both carry a monotonic status: once terminal, a record never
//! re-enters a non-terminal state. The state stores enforce this on write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a generation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Accepted by admission control, no chunk dispatched yet.
    Queued,
    /// At least one chunk has been dispatched.
    Running,
    /// All chunks succeeded; the assembled result is available.
    Completed,
    /// A chunk exhausted its retries or failed permanently (fail-fast), or
    /// durable state could not be guaranteed.
    Failed,
    /// The session exceeded its wall-clock budget.
    TimedOut,
    /// The session was cancelled by an external request.
    Cancelled,
}

impl SessionStatus {
    /// Stable string form used in the state store and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse the stable string form back into a status.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "timed_out" => Some(Self::TimedOut),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Whether this status is terminal. Terminal sessions never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    /// Whether this session counts against the admission ceiling.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Queued → Running on first chunk dispatch; Running → any terminal;
    /// Queued may also jump straight to Cancelled or Failed (admission
    /// accepted but the session never dispatched).
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        match self {
            Self::Queued => matches!(
                next,
                SessionStatus::Running
                    | SessionStatus::Failed
                    | SessionStatus::TimedOut
                    | SessionStatus::Cancelled
            ),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

/// Status of a single chunk within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    /// Not yet admitted to a chunk slot.
    Pending,
    /// An attempt is in flight.
    Running,
    /// A transient failure occurred; waiting out the backoff delay.
    Retrying,
    /// Generation produced output.
    Succeeded,
    /// The retry ceiling was exhausted or a permanent failure occurred.
    Failed,
    /// The session's wall-clock budget ran out before this chunk finished.
    TimedOut,
    /// The session was cancelled while this chunk was pending or in flight.
    Cancelled,
}

impl ChunkStatus {
    /// Stable string form used in the state store and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse the stable string form back into a status.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "retrying" => Some(Self::Retrying),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "timed_out" => Some(Self::TimedOut),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Whether this status is terminal for the chunk.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }
}

/// Durable record of a generation session.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    /// Unique identifier (UUID v4).
    pub session_id: String,
    /// Opaque caller/session reference supplied at submission.
    pub owner_context: String,
    /// Current status.
    pub status: SessionStatus,
    /// Number of chunks in this session.
    pub chunk_count: u32,
    /// When the session was accepted.
    pub created_at: DateTime<Utc>,
    /// When the first chunk was dispatched.
    pub started_at: Option<DateTime<Utc>>,
    /// When the session reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Error message for Failed sessions.
    pub error: Option<String>,
    /// How/why the session reached its terminal state
    /// (chunk_exhausted, timeout, cancelled, persistence_failure, orphaned).
    pub termination_reason: Option<String>,
}

/// Durable record of a single chunk.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    /// Session this chunk belongs to.
    pub session_id: String,
    /// Position within the session, unique per session.
    pub index: u32,
    /// Current status.
    pub status: ChunkStatus,
    /// Attempt count; 0 until the first attempt starts.
    pub attempt: u32,
    /// The generation prompt for this chunk.
    pub prompt: String,
    /// Estimated provider token cost, used for rate-limiter accounting.
    pub estimated_tokens: u32,
    /// Generated content once Succeeded.
    pub output: Option<String>,
    /// Classified failure message for the most recent failed attempt.
    pub error: Option<String>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl ChunkRecord {
    /// Build the initial Pending record for one chunk of a new session.
    pub fn pending(session_id: &str, index: u32, spec: &ChunkSpec) -> Self {
        Self {
            session_id: session_id.to_string(),
            index,
            status: ChunkStatus::Pending,
            attempt: 0,
            prompt: spec.prompt.clone(),
            estimated_tokens: spec.estimated_tokens,
            output: None,
            error: None,
            updated_at: Utc::now(),
        }
    }
}

/// One chunk of a generation request as submitted by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSpec {
    /// The generation prompt.
    pub prompt: String,
    /// Estimated provider token cost for this chunk.
    pub estimated_tokens: u32,
}

/// A generation request as submitted by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Opaque caller/session reference.
    pub owner_context: String,
    /// Ordered chunks; admission order follows this ordering.
    pub chunks: Vec<ChunkSpec>,
}

/// Per-chunk progress as exposed to pollers.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkProgress {
    /// Position within the session.
    pub index: u32,
    /// Current status.
    pub status: ChunkStatus,
    /// Attempt count so far.
    pub attempt: u32,
    /// Classified failure message, if any.
    pub error: Option<String>,
}

/// Point-in-time view of a session, served by the poll contract.
///
/// `result` is populated only for Completed sessions; a TimedOut session
/// exposes no deliverable even when some chunks succeeded.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    /// Session identifier.
    pub session_id: String,
    /// Opaque caller/session reference.
    pub owner_context: String,
    /// Current status.
    pub status: SessionStatus,
    /// When the session was accepted.
    pub created_at: DateTime<Utc>,
    /// When the session reached a terminal state, if it has.
    pub finished_at: Option<DateTime<Utc>>,
    /// Per-chunk progress, index-ascending.
    pub chunks: Vec<ChunkProgress>,
    /// Chunk outputs in index order, present only when Completed.
    pub result: Option<Vec<String>>,
    /// Error message for Failed sessions.
    pub error: Option<String>,
    /// How/why the session terminated.
    pub termination_reason: Option<String>,
}

/// Audit event appended on session and chunk transitions.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    /// Session this event belongs to.
    pub session_id: String,
    /// Event type (session_started, chunk_succeeded, chunk_retrying, ...).
    pub event_type: String,
    /// Chunk index for chunk-level events.
    pub chunk_index: Option<u32>,
    /// Optional free-form detail.
    pub detail: Option<String>,
    /// When the event occurred.
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    /// Build a session-level event.
    pub fn session(session_id: &str, event_type: &str, detail: Option<String>) -> Self {
        Self {
            session_id: session_id.to_string(),
            event_type: event_type.to_string(),
            chunk_index: None,
            detail,
            created_at: Utc::now(),
        }
    }

    /// Build a chunk-level event.
    pub fn chunk(session_id: &str, index: u32, event_type: &str, detail: Option<String>) -> Self {
        Self {
            session_id: session_id.to_string(),
            event_type: event_type.to_string(),
            chunk_index: Some(index),
            detail,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_status_round_trip() {
        for status in [
            SessionStatus::Queued,
            SessionStatus::Running,
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::TimedOut,
            SessionStatus::Cancelled,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SessionStatus::parse("bogus"), None);
        assert_eq!(SessionStatus::parse(""), None);
    }

    #[test]
    fn test_chunk_status_round_trip() {
        for status in [
            ChunkStatus::Pending,
            ChunkStatus::Running,
            ChunkStatus::Retrying,
            ChunkStatus::Succeeded,
            ChunkStatus::Failed,
            ChunkStatus::TimedOut,
            ChunkStatus::Cancelled,
        ] {
            assert_eq!(ChunkStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ChunkStatus::parse("bogus"), None);
    }

    #[test]
    fn test_terminal_classification() {
        assert!(!SessionStatus::Queued.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(SessionStatus::TimedOut.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());

        assert!(SessionStatus::Queued.is_active());
        assert!(SessionStatus::Running.is_active());
        assert!(!SessionStatus::Completed.is_active());
    }

    #[test]
    fn test_transitions_from_queued() {
        let q = SessionStatus::Queued;
        assert!(q.can_transition_to(SessionStatus::Running));
        assert!(q.can_transition_to(SessionStatus::Cancelled));
        assert!(q.can_transition_to(SessionStatus::Failed));
        assert!(q.can_transition_to(SessionStatus::TimedOut));
        assert!(!q.can_transition_to(SessionStatus::Queued));
        // A session with undispatched chunks is never Completed
        assert!(!q.can_transition_to(SessionStatus::Completed));
    }

    #[test]
    fn test_transitions_from_running() {
        let r = SessionStatus::Running;
        assert!(r.can_transition_to(SessionStatus::Completed));
        assert!(r.can_transition_to(SessionStatus::Failed));
        assert!(r.can_transition_to(SessionStatus::TimedOut));
        assert!(r.can_transition_to(SessionStatus::Cancelled));
        assert!(!r.can_transition_to(SessionStatus::Queued));
        assert!(!r.can_transition_to(SessionStatus::Running));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::TimedOut,
            SessionStatus::Cancelled,
        ] {
            for next in [
                SessionStatus::Queued,
                SessionStatus::Running,
                SessionStatus::Completed,
                SessionStatus::Failed,
                SessionStatus::TimedOut,
                SessionStatus::Cancelled,
            ] {
                assert!(
                    !terminal.can_transition_to(next),
                    "{:?} must not transition to {:?}",
                    terminal,
                    next
                );
            }
        }
    }

    #[test]
    fn test_chunk_pending_record() {
        let spec = ChunkSpec {
            prompt: "write the intro".to_string(),
            estimated_tokens: 800,
        };
        let chunk = ChunkRecord::pending("s-1", 2, &spec);
        assert_eq!(chunk.session_id, "s-1");
        assert_eq!(chunk.index, 2);
        assert_eq!(chunk.status, ChunkStatus::Pending);
        assert_eq!(chunk.attempt, 0);
        assert_eq!(chunk.estimated_tokens, 800);
        assert!(chunk.output.is_none());
        assert!(chunk.error.is_none());
    }

    #[test]
    fn test_event_constructors() {
        let e = EventRecord::session("s-1", "session_started", None);
        assert_eq!(e.session_id, "s-1");
        assert_eq!(e.event_type, "session_started");
        assert!(e.chunk_index.is_none());

        let e = EventRecord::chunk("s-1", 3, "chunk_retrying", Some("429".to_string()));
        assert_eq!(e.chunk_index, Some(3));
        assert_eq!(e.detail.as_deref(), Some("429"));
    }

    #[test]
    fn test_status_serde_snake_case() {
        let json = serde_json::to_string(&SessionStatus::TimedOut).unwrap();
        assert_eq!(json, "\"timed_out\"");
        let json = serde_json::to_string(&ChunkStatus::Succeeded).unwrap();
        assert_eq!(json, "\"succeeded\"");
    }
}
