//! Model discovery across all configured services.
//!
//! A refresh asks every service for its models, drops non-chat models, and
//! swaps the result in as one snapshot. Failing services are recorded next to
//! the snapshot rather than aborting the pass.

use crate::drivers::DriverFactory;
use crate::error::{CatalogError, LlmError};
use crate::models::{AvailableModelEntry, LlmModel};
use crate::service::ServiceConfiguration;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Ids that are not chat models: embeddings, image, speech, moderation,
/// realtime audio and legacy completion-only models.
pub const EXCLUDED_MODEL_IDS: &[&str] = &[
    "text-embedding-004",
    "aqa",
    "dall-e-2",
    "dall-e-3",
    "tts-1",
    "tts-1-hd",
    "tts-1-1106",
    "tts-1-hd-1106",
    "whisper-1",
    "gpt-4o-realtime-preview",
    "gpt-4o-mini-realtime-preview",
    "gpt-3.5-turbo-instruct",
    "gpt-3.5-turbo-instruct-0914",
    "babbage-002",
    "davinci-002",
    "text-embedding-ada-002",
    "text-embedding-3-small",
    "text-embedding-3-large",
    "gpt-4o-mini-realtime-preview-2024-12-17",
    "gpt-4o-realtime-preview-2024-10-01",
    "gpt-4o-realtime-preview-2024-12-17",
    "omni-moderation-2024-09-26",
    "omni-moderation-latest",
];

pub fn is_excluded(model_id: &str) -> bool {
    EXCLUDED_MODEL_IDS.contains(&model_id)
}

/// A service whose listing failed during the last refresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceFailure {
    pub service_id: String,
    pub service_name: String,
    pub error: LlmError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RefreshOutcome {
    Completed { models: usize, failures: usize },
    /// Another refresh was already running; this one was dropped.
    Skipped,
}

#[derive(Debug, Default)]
struct Snapshot {
    models: Vec<LlmModel>,
    service_errors: Vec<ServiceFailure>,
}

/// Resets the busy flag however the refresh ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ModelCatalog {
    factory: Arc<dyn DriverFactory>,
    max_concurrency: usize,
    refreshing: AtomicBool,
    snapshot: RwLock<Snapshot>,
    disabled: Mutex<BTreeSet<String>>,
    disabled_path: Option<PathBuf>,
}

impl ModelCatalog {
    /// Catalog whose disabled set lives only in memory.
    pub fn new(factory: Arc<dyn DriverFactory>, max_concurrency: usize) -> Self {
        Self {
            factory,
            max_concurrency: max_concurrency.max(1),
            refreshing: AtomicBool::new(false),
            snapshot: RwLock::new(Snapshot::default()),
            disabled: Mutex::new(BTreeSet::new()),
            disabled_path: None,
        }
    }

    /// Catalog with the disabled set persisted as a JSON array at `path`.
    pub async fn open(
        factory: Arc<dyn DriverFactory>,
        max_concurrency: usize,
        path: impl Into<PathBuf>,
    ) -> Result<Self, CatalogError> {
        let path = path.into();
        let disabled = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str::<BTreeSet<String>>(&content)
                .map_err(|e| CatalogError::Decode(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => return Err(CatalogError::Io(e.to_string())),
        };
        Ok(Self {
            disabled: Mutex::new(disabled),
            disabled_path: Some(path),
            ..Self::new(factory, max_concurrency)
        })
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }

    /// Re-list models for `services`. Dropped if a refresh is already running.
    pub async fn refresh(&self, services: Vec<ServiceConfiguration>) -> RefreshOutcome {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Refresh already running, skipping");
            return RefreshOutcome::Skipped;
        }
        let _busy = BusyGuard(&self.refreshing);

        tracing::info!(services = services.len(), "Refreshing models");
        let results: Vec<(ServiceConfiguration, Result<Vec<AvailableModelEntry>, LlmError>)> =
            stream::iter(services)
                .map(|config| {
                    let factory = self.factory.clone();
                    async move {
                        let driver = factory.driver_for(&config).await;
                        let listing = driver.list_models().await;
                        (config, listing)
                    }
                })
                .buffered(self.max_concurrency)
                .collect()
                .await;

        let mut models = Vec::new();
        let mut service_errors = Vec::new();
        for (config, listing) in results {
            match listing {
                Ok(entries) => {
                    tracing::debug!(service = %config.id, models = entries.len(), "Service listed");
                    models.extend(
                        entries
                            .into_iter()
                            .filter(|entry| !is_excluded(&entry.id))
                            .map(|entry| LlmModel::new(config.clone(), entry)),
                    );
                }
                Err(error) => {
                    tracing::warn!(service = %config.id, error = %error, "Model listing failed");
                    service_errors.push(ServiceFailure {
                        service_id: config.id,
                        service_name: config.name,
                        error,
                    });
                }
            }
        }

        let outcome = RefreshOutcome::Completed {
            models: models.len(),
            failures: service_errors.len(),
        };
        *self.snapshot.write().await = Snapshot {
            models,
            service_errors,
        };
        tracing::info!(?outcome, "Refresh finished");
        outcome
    }

    pub async fn models(&self) -> Vec<LlmModel> {
        self.snapshot.read().await.models.clone()
    }

    pub async fn enabled_models(&self) -> Vec<LlmModel> {
        self.partition(false).await
    }

    pub async fn disabled_models(&self) -> Vec<LlmModel> {
        self.partition(true).await
    }

    pub async fn service_errors(&self) -> Vec<ServiceFailure> {
        self.snapshot.read().await.service_errors.clone()
    }

    pub async fn find(&self, model_id: &str) -> Option<LlmModel> {
        self.snapshot
            .read()
            .await
            .models
            .iter()
            .find(|m| m.id == model_id)
            .cloned()
    }

    pub async fn is_disabled(&self, model_id: &str) -> bool {
        self.disabled.lock().await.contains(model_id)
    }

    /// Flip a model between enabled and disabled. Returns whether it is now enabled.
    pub async fn toggle_model(&self, model_id: &str) -> Result<bool, CatalogError> {
        let mut disabled = self.disabled.lock().await;
        let mut next = disabled.clone();
        let enabled = if next.remove(model_id) {
            true
        } else {
            next.insert(model_id.to_string());
            false
        };
        self.save_disabled(&next).await?;
        *disabled = next;
        tracing::info!(model = %model_id, enabled, "Model toggled");
        Ok(enabled)
    }

    async fn partition(&self, want_disabled: bool) -> Vec<LlmModel> {
        let disabled = self.disabled.lock().await.clone();
        self.snapshot
            .read()
            .await
            .models
            .iter()
            .filter(|m| disabled.contains(&m.id) == want_disabled)
            .cloned()
            .collect()
    }

    async fn save_disabled(&self, disabled: &BTreeSet<String>) -> Result<(), CatalogError> {
        let Some(path) = &self.disabled_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CatalogError::Io(e.to_string()))?;
        }
        let content =
            serde_json::to_string_pretty(disabled).map_err(|e| CatalogError::Encode(e.to_string()))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| CatalogError::Io(e.to_string()))
    }
}
