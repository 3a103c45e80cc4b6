// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for draftforge-core.
//!
//! Provides a unified error type with stable error codes for the embedding
//! API layer to map onto its own responses.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while orchestrating generation sessions.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Admission was refused because the process is at its session ceiling.
    ///
    /// Surfaced synchronously to the caller; the orchestrator never queues
    /// over-capacity requests, the caller decides whether to retry later.
    CapacityExceeded {
        /// Number of sessions currently in Queued or Running.
        active: usize,
        /// The configured `max_concurrent_sessions` ceiling.
        limit: usize,
    },

    /// Session was not found in the state store.
    SessionNotFound {
        /// The session ID that was not found.
        session_id: String,
    },

    /// Session is in an invalid state for the requested operation.
    InvalidSessionState {
        /// The session ID.
        session_id: String,
        /// The expected status.
        expected: String,
        /// The actual status.
        actual: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// State store operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            Self::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            Self::InvalidSessionState { .. } => "INVALID_SESSION_STATE",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapacityExceeded { active, limit } => {
                write!(
                    f,
                    "Session capacity exceeded: {} active of {} allowed",
                    active, limit
                )
            }
            Self::SessionNotFound { session_id } => {
                write!(f, "Session '{}' not found", session_id)
            }
            Self::InvalidSessionState {
                session_id,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Session '{}' is in invalid state: expected '{}', got '{}'",
                    session_id, expected, actual
                )
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
