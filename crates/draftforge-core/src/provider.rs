// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provider client interface.
//!
//! The orchestrator talks to the external AI provider exclusively through
//! [`ProviderClient`]. Implementations live outside this crate (see
//! `draftforge-ai` for the OpenAI-compatible HTTP client); tests use
//! scripted mocks.

use std::time::Duration;

use async_trait::async_trait;

/// One chunk-generation request handed to the provider.
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    /// Session this chunk belongs to.
    pub session_id: String,
    /// Opaque caller/session reference, forwarded for provider-side tracing.
    pub owner_context: String,
    /// Position of the chunk within the session.
    pub chunk_index: u32,
    /// The generation prompt.
    pub prompt: String,
    /// Estimated token cost, already accounted by the rate limiter.
    pub estimated_tokens: u32,
    /// Remaining time budget for this attempt. Implementations must honor
    /// it and return promptly once it elapses.
    pub deadline: Duration,
}

/// Successful provider output for one chunk.
#[derive(Debug, Clone)]
pub struct GeneratedChunk {
    /// The generated content.
    pub content: String,
    /// Token usage reported by the provider, when available.
    pub tokens_used: Option<u32>,
}

/// Classified provider failure.
///
/// The classification drives the retry decision: transient and rate-limited
/// failures are retried with backoff up to the configured ceiling,
/// permanent failures fail the chunk immediately.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Network error, provider 5xx, or other retryable condition.
    #[error("transient provider failure: {message}")]
    Transient {
        /// Failure detail.
        message: String,
    },

    /// The provider rejected the call for rate reasons (429-equivalent).
    #[error("provider rate limited: {message}")]
    RateLimited {
        /// Failure detail.
        message: String,
        /// Provider-suggested wait before retrying, when supplied.
        retry_after: Option<Duration>,
    },

    /// Invalid input, content-policy rejection, or other non-retryable
    /// condition.
    #[error("permanent provider failure: {message}")]
    Permanent {
        /// Failure detail.
        message: String,
    },
}

impl ProviderError {
    /// Whether this failure is eligible for retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent { .. })
    }

    /// Stable category string for logs and events.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Transient { .. } => "transient",
            Self::RateLimited { .. } => "rate_limited",
            Self::Permanent { .. } => "permanent",
        }
    }

    /// Provider-suggested retry delay, when the failure carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Interface to the external AI provider.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Generate the content for one chunk.
    ///
    /// Must honor `request.deadline` and return promptly on cancellation of
    /// the surrounding task; an abandoned call's eventual result is
    /// discarded by the executor.
    async fn generate(&self, request: &ChunkRequest) -> Result<GeneratedChunk, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(
            ProviderError::Transient {
                message: "connection reset".to_string()
            }
            .is_retryable()
        );
        assert!(
            ProviderError::RateLimited {
                message: "429".to_string(),
                retry_after: None
            }
            .is_retryable()
        );
        assert!(
            !ProviderError::Permanent {
                message: "content policy".to_string()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            ProviderError::Transient {
                message: "x".to_string()
            }
            .category(),
            "transient"
        );
        assert_eq!(
            ProviderError::RateLimited {
                message: "x".to_string(),
                retry_after: None
            }
            .category(),
            "rate_limited"
        );
        assert_eq!(
            ProviderError::Permanent {
                message: "x".to_string()
            }
            .category(),
            "permanent"
        );
    }

    #[test]
    fn test_retry_after_only_for_rate_limited() {
        let err = ProviderError::RateLimited {
            message: "429".to_string(),
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));

        let err = ProviderError::Transient {
            message: "reset".to_string(),
        };
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn test_display() {
        let err = ProviderError::RateLimited {
            message: "too many requests".to_string(),
            retry_after: None,
        };
        assert_eq!(err.to_string(), "provider rate limited: too many requests");
    }
}
