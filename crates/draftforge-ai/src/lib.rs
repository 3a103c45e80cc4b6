// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AI provider client for draftforge.
//!
//! [`HttpProvider`] implements the core's
//! [`ProviderClient`](draftforge_core::provider::ProviderClient) trait over
//! an OpenAI-compatible `/v1/chat/completions` endpoint. Failures are
//! classified for the orchestrator's retry policy:
//!
//! - HTTP 429 → `RateLimited` (with the `Retry-After` hint when present)
//! - HTTP 5xx, timeouts, transport errors → `Transient`
//! - other HTTP 4xx, malformed responses → `Permanent`
//!
//! The client honors the per-attempt deadline supplied by the chunk
//! executor; an attempt never outlives its session's remaining budget.

#![deny(missing_docs)]

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use draftforge_core::provider::{ChunkRequest, GeneratedChunk, ProviderClient, ProviderError};

/// Configuration for [`HttpProvider`].
#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    /// Base URL of the OpenAI-compatible API (no trailing path).
    pub base_url: String,
    /// Bearer token for the provider API.
    pub api_key: String,
    /// Model identifier to request.
    pub model: String,
    /// Optional cap on generated tokens per chunk.
    pub max_output_tokens: Option<u32>,
}

impl HttpProviderConfig {
    /// Load provider configuration from environment variables.
    ///
    /// Required:
    /// - `DRAFTFORGE_PROVIDER_API_KEY`: bearer token
    ///
    /// Optional (with defaults):
    /// - `DRAFTFORGE_PROVIDER_BASE_URL`: default `https://api.openai.com`
    /// - `DRAFTFORGE_PROVIDER_MODEL`: default `gpt-4o-mini`
    /// - `DRAFTFORGE_PROVIDER_MAX_OUTPUT_TOKENS`: no cap when unset
    pub fn from_env() -> Result<Self, ProviderConfigError> {
        let api_key = std::env::var("DRAFTFORGE_PROVIDER_API_KEY")
            .map_err(|_| ProviderConfigError::Missing("DRAFTFORGE_PROVIDER_API_KEY"))?;

        let base_url = std::env::var("DRAFTFORGE_PROVIDER_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com".to_string());

        let model = std::env::var("DRAFTFORGE_PROVIDER_MODEL")
            .unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let max_output_tokens = match std::env::var("DRAFTFORGE_PROVIDER_MAX_OUTPUT_TOKENS") {
            Ok(raw) => Some(raw.parse().map_err(|_| {
                ProviderConfigError::Invalid(
                    "DRAFTFORGE_PROVIDER_MAX_OUTPUT_TOKENS",
                    "must be a positive integer",
                )
            })?),
            Err(_) => None,
        };

        Ok(Self {
            base_url,
            api_key,
            model,
            max_output_tokens,
        })
    }
}

/// Provider configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ProviderConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

/// OpenAI-compatible HTTP provider client.
pub struct HttpProvider {
    client: reqwest::Client,
    config: HttpProviderConfig,
}

impl HttpProvider {
    /// Create a provider client from the given configuration.
    pub fn new(config: HttpProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Create a provider client from environment variables.
    pub fn from_env() -> Result<Self, ProviderConfigError> {
        Ok(Self::new(HttpProviderConfig::from_env()?))
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    completion_tokens: Option<u32>,
}

// ============================================================================
// Classification
// ============================================================================

/// Map an HTTP status to the orchestrator's failure taxonomy.
fn classify_status(
    status: reqwest::StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> ProviderError {
    let message = format!("provider returned {}: {}", status, truncate(body, 200));
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        ProviderError::RateLimited {
            message,
            retry_after,
        }
    } else if status.is_server_error() {
        ProviderError::Transient { message }
    } else {
        ProviderError::Permanent { message }
    }
}

fn classify_send_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Transient {
            message: "provider call timed out".to_string(),
        }
    } else {
        ProviderError::Transient {
            message: format!("provider request failed: {}", err),
        }
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl ProviderClient for HttpProvider {
    async fn generate(&self, request: &ChunkRequest) -> Result<GeneratedChunk, ProviderError> {
        let body = ChatCompletionRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            max_tokens: self.config.max_output_tokens,
        };

        debug!(
            session_id = %request.session_id,
            chunk_index = request.chunk_index,
            model = %self.config.model,
            deadline_ms = request.deadline.as_millis() as u64,
            "Calling provider"
        );

        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.config.api_key)
            .timeout(request.deadline)
            .json(&body)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(&response);
            let body = response.text().await.unwrap_or_default();
            let err = classify_status(status, retry_after, &body);
            warn!(
                session_id = %request.session_id,
                chunk_index = request.chunk_index,
                status = status.as_u16(),
                category = err.category(),
                "Provider call failed"
            );
            return Err(err);
        }

        let parsed: ChatCompletionResponse =
            response.json().await.map_err(|e| ProviderError::Permanent {
                message: format!("provider response was not valid JSON: {}", e),
            })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ProviderError::Permanent {
                message: "provider returned no content".to_string(),
            })?;

        Ok(GeneratedChunk {
            content,
            tokens_used: parsed.usage.and_then(|u| u.completion_tokens),
        })
    }
}
