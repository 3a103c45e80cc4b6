// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for draftforge-core.
//!
//! This module provides [`OrchestratorRuntime`] which allows embedding the
//! generation orchestrator into an existing tokio application (typically
//! the API layer that accepts generation requests and serves status).
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use draftforge_core::config::Config;
//! use draftforge_core::persistence::SqliteStore;
//! use draftforge_core::runtime::OrchestratorRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteStore::from_path(".data/draftforge.db").await?);
//!     let provider = Arc::new(my_provider_client());
//!
//!     let runtime = OrchestratorRuntime::builder()
//!         .config(Config::from_env()?)
//!         .store(store)
//!         .provider(provider)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let orchestrator = runtime.orchestrator();
//!     // ... submit / poll / cancel through the orchestrator ...
//!
//!     // Graceful shutdown
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::orchestrator::Orchestrator;
use crate::persistence::StateStore;
use crate::provider::ProviderClient;
use crate::retention::{RetentionConfig, RetentionWorker};

/// Builder for creating an [`OrchestratorRuntime`].
pub struct OrchestratorRuntimeBuilder {
    config: Config,
    store: Option<Arc<dyn StateStore>>,
    provider: Option<Arc<dyn ProviderClient>>,
    retention: Option<RetentionConfig>,
}

impl std::fmt::Debug for OrchestratorRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorRuntimeBuilder")
            .field("config", &self.config)
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("provider", &self.provider.as_ref().map(|_| "..."))
            .field("retention", &self.retention)
            .finish()
    }
}

impl Default for OrchestratorRuntimeBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            store: None,
            provider: None,
            retention: None,
        }
    }
}

impl OrchestratorRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the orchestrator configuration.
    ///
    /// Default: [`Config::default`].
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the state store (required).
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the provider client (required).
    pub fn provider(mut self, provider: Arc<dyn ProviderClient>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Enable the background retention worker with the given settings.
    ///
    /// Disabled by default.
    pub fn retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<OrchestratorRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let provider = self
            .provider
            .ok_or_else(|| anyhow::anyhow!("provider is required"))?;

        Ok(OrchestratorRuntimeConfig {
            config: self.config,
            store,
            provider,
            retention: self.retention,
        })
    }
}

/// Configuration for an [`OrchestratorRuntime`].
pub struct OrchestratorRuntimeConfig {
    config: Config,
    store: Arc<dyn StateStore>,
    provider: Arc<dyn ProviderClient>,
    retention: Option<RetentionConfig>,
}

impl std::fmt::Debug for OrchestratorRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorRuntimeConfig")
            .field("config", &self.config)
            .field("store", &"...")
            .field("provider", &"...")
            .field("retention", &self.retention)
            .finish()
    }
}

impl OrchestratorRuntimeConfig {
    /// Start the runtime.
    ///
    /// Verifies store health, fails sessions orphaned by a previous run,
    /// and spawns the retention worker when configured.
    pub async fn start(self) -> Result<OrchestratorRuntime> {
        let healthy = self.store.health_check().await?;
        if !healthy {
            return Err(anyhow::anyhow!("state store failed its health check"));
        }

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(self.config),
            self.store.clone(),
            self.provider,
        ));

        let recovered = orchestrator.recover_orphaned_sessions().await?;
        if recovered > 0 {
            info!(recovered, "Recovered orphaned sessions from previous run");
        }

        let (retention_worker, retention_handle) = match self.retention {
            Some(retention_config) => {
                let worker = Arc::new(RetentionWorker::new(self.store.clone(), retention_config));
                let run_worker = worker.clone();
                let handle = tokio::spawn(async move { run_worker.run().await });
                (Some(worker), Some(handle))
            }
            None => (None, None),
        };

        info!("OrchestratorRuntime started");

        Ok(OrchestratorRuntime {
            orchestrator,
            retention_worker,
            retention_handle,
        })
    }
}

/// A running orchestrator that can be embedded in an application.
///
/// The runtime manages:
/// - the orchestrator (admission, scheduling, poll/cancel surface)
/// - the optional background retention worker
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct OrchestratorRuntime {
    orchestrator: Arc<Orchestrator>,
    retention_worker: Option<Arc<RetentionWorker>>,
    retention_handle: Option<JoinHandle<()>>,
}

impl OrchestratorRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> OrchestratorRuntimeBuilder {
        OrchestratorRuntimeBuilder::new()
    }

    /// Get the orchestrator handle for submit/poll/cancel.
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Gracefully shut down the runtime.
    ///
    /// Cancels every active session, waits for schedulers to persist
    /// terminal state, and stops the retention worker.
    pub async fn shutdown(self) {
        info!("OrchestratorRuntime shutting down...");

        self.orchestrator.shutdown().await;

        if let Some(worker) = &self.retention_worker {
            worker.shutdown_handle().notify_one();
        }
        if let Some(handle) = self.retention_handle {
            if let Err(e) = handle.await {
                error!("Retention worker task panicked: {}", e);
            }
        }

        info!("OrchestratorRuntime shutdown complete");
    }
}
