//! Service configurations and the persisted service list.

use crate::credentials::CredentialManager;
use crate::error::ServiceError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Wire protocol spoken by a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProtocolKind {
    #[serde(rename = "openai", alias = "openai-compatible")]
    OpenAi,
    #[serde(rename = "anthropic", alias = "claude", alias = "anthropic-compatible")]
    Anthropic,
}

impl ProtocolKind {
    pub fn all() -> [ProtocolKind; 2] {
        [ProtocolKind::OpenAi, ProtocolKind::Anthropic]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::OpenAi => "openai",
            ProtocolKind::Anthropic => "anthropic",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProtocolKind::OpenAi => "OpenAI",
            ProtocolKind::Anthropic => "Claude",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProtocolKind::OpenAi => "https://api.openai.com/v1",
            ProtocolKind::Anthropic => "https://api.anthropic.com/v1",
        }
    }

    pub fn thumbnail_url(&self) -> &'static str {
        match self {
            ProtocolKind::OpenAi => "https://openai.com/favicon.ico",
            ProtocolKind::Anthropic => "https://claude.ai/favicon.ico",
        }
    }
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ProtocolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" | "openai-compatible" => Ok(ProtocolKind::OpenAi),
            "anthropic" | "claude" | "anthropic-compatible" => Ok(ProtocolKind::Anthropic),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

/// A named endpoint speaking one protocol. The API key is stored separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfiguration {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub endpoint_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub protocol: ProtocolKind,
    #[serde(default)]
    pub last_update: DateTime<Utc>,
}

impl ServiceConfiguration {
    /// Ids of three characters or fewer are replaced with `"<protocol>:<uuid>"`.
    pub fn new(
        id: Option<String>,
        name: impl Into<String>,
        protocol: ProtocolKind,
        endpoint_url: impl Into<String>,
    ) -> Self {
        let id = match id {
            Some(id) if id.chars().count() > 3 => id,
            _ => format!("{}:{}", protocol, Uuid::new_v4()),
        };
        Self {
            id,
            name: name.into(),
            comment: None,
            endpoint_url: endpoint_url.into(),
            thumbnail_url: None,
            username: None,
            protocol,
            last_update: Utc::now(),
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_thumbnail(mut self, url: impl Into<String>) -> Self {
        self.thumbnail_url = Some(url.into());
        self
    }

    /// Endpoint without a trailing slash, ready for path joins.
    pub fn base_url(&self) -> &str {
        self.endpoint_url.trim_end_matches('/')
    }

    /// Built-in services: one per protocol plus known compatible vendors.
    pub fn default_configurations() -> Vec<ServiceConfiguration> {
        let epoch = DateTime::<Utc>::default();
        let mut defaults: Vec<ServiceConfiguration> = ProtocolKind::all()
            .into_iter()
            .map(|kind| ServiceConfiguration {
                id: kind.as_str().to_string(),
                name: kind.display_name().to_string(),
                comment: None,
                endpoint_url: kind.default_base_url().to_string(),
                thumbnail_url: Some(kind.thumbnail_url().to_string()),
                username: None,
                protocol: kind,
                last_update: epoch,
            })
            .collect();

        defaults.push(ServiceConfiguration {
            id: "GoogleGemini-openai-builtin".to_string(),
            name: "Gemini".to_string(),
            comment: Some("Google Gemini via OpenAI Compatibility endpoint".to_string()),
            endpoint_url: "https://generativelanguage.googleapis.com/v1beta/openai".to_string(),
            thumbnail_url: Some("https://google.com/favicon.ico".to_string()),
            username: None,
            protocol: ProtocolKind::OpenAi,
            last_update: epoch,
        });
        defaults.push(ServiceConfiguration {
            id: "Deepseek-openai-builtin".to_string(),
            name: "Deepseek".to_string(),
            comment: None,
            endpoint_url: "https://api.deepseek.com/v1".to_string(),
            thumbnail_url: Some("https://deepseek.com/favicon.ico".to_string()),
            username: None,
            protocol: ProtocolKind::OpenAi,
            last_update: epoch,
        });
        defaults
    }
}

/// A configuration together with its key at one point in time.
#[derive(Clone, PartialEq)]
pub struct ServiceSnapshot {
    pub configuration: ServiceConfiguration,
    pub api_key: Option<String>,
}

impl std::fmt::Debug for ServiceSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceSnapshot")
            .field("configuration", &self.configuration)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ServiceFile {
    #[serde(default)]
    services: Vec<ServiceConfiguration>,
}

/// Owner of the service list. Mutations persist before they are visible.
pub struct ServiceRegistry {
    path: Option<PathBuf>,
    services: Mutex<Vec<ServiceConfiguration>>,
    credentials: CredentialManager,
}

impl ServiceRegistry {
    /// Load the list at `path`, merging in built-in services.
    pub async fn open(
        path: impl Into<PathBuf>,
        credentials: CredentialManager,
    ) -> Result<Self, ServiceError> {
        let path = path.into();
        let persisted = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let file: ServiceFile =
                    toml::from_str(&content).map_err(|e| ServiceError::Decode(e.to_string()))?;
                Some(file.services)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(ServiceError::Io(e.to_string())),
        };

        let (services, added_defaults) = merge_with_defaults(persisted.unwrap_or_default());
        let registry = Self {
            path: Some(path),
            services: Mutex::new(services),
            credentials,
        };
        if added_defaults {
            let services = registry.services.lock().await;
            registry.save(&services).await?;
        }
        Ok(registry)
    }

    /// Registry holding only built-in services, never written to disk.
    pub fn in_memory(credentials: CredentialManager) -> Self {
        Self {
            path: None,
            services: Mutex::new(ServiceConfiguration::default_configurations()),
            credentials,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn credentials(&self) -> &CredentialManager {
        &self.credentials
    }

    pub async fn list(&self) -> Vec<ServiceConfiguration> {
        self.services.lock().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<ServiceConfiguration> {
        self.services.lock().await.iter().find(|s| s.id == id).cloned()
    }

    /// Append a service, or replace the one with the same id.
    pub async fn add(&self, mut config: ServiceConfiguration) -> Result<(), ServiceError> {
        let mut services = self.services.lock().await;
        let mut next = services.clone();
        config.last_update = Utc::now();
        match next.iter_mut().find(|s| s.id == config.id) {
            Some(existing) => *existing = config,
            None => next.push(config),
        }
        self.save(&next).await?;
        *services = next;
        Ok(())
    }

    pub async fn update(&self, mut config: ServiceConfiguration) -> Result<(), ServiceError> {
        let mut services = self.services.lock().await;
        let mut next = services.clone();
        let existing = next
            .iter_mut()
            .find(|s| s.id == config.id)
            .ok_or_else(|| ServiceError::NotFound(config.id.clone()))?;
        config.last_update = Utc::now();
        *existing = config;
        self.save(&next).await?;
        *services = next;
        Ok(())
    }

    /// Remove a service and its stored key.
    pub async fn delete(&self, id: &str) -> Result<(), ServiceError> {
        let mut services = self.services.lock().await;
        if !services.iter().any(|s| s.id == id) {
            return Err(ServiceError::NotFound(id.to_string()));
        }
        let next: Vec<ServiceConfiguration> =
            services.iter().filter(|s| s.id != id).cloned().collect();
        self.save(&next).await?;
        *services = next;
        drop(services);

        // The service is already gone; a key that fails to delete is only orphaned.
        if let Err(e) = self.credentials.set_api_key(id, None).await {
            tracing::warn!(service = %id, error = %e, "Stored key not removed");
        }
        tracing::info!(service = %id, "Service deleted");
        Ok(())
    }

    async fn save(&self, services: &[ServiceConfiguration]) -> Result<(), ServiceError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ServiceError::Io(e.to_string()))?;
        }
        let file = ServiceFile {
            services: services.to_vec(),
        };
        let content =
            toml::to_string_pretty(&file).map_err(|e| ServiceError::Encode(e.to_string()))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| ServiceError::Io(e.to_string()))
    }
}

/// Defaults first (a persisted entry with the same id wins), then the rest in
/// persisted order. The flag reports whether any default was missing.
fn merge_with_defaults(persisted: Vec<ServiceConfiguration>) -> (Vec<ServiceConfiguration>, bool) {
    let mut added = false;
    let mut merged: Vec<ServiceConfiguration> = ServiceConfiguration::default_configurations()
        .into_iter()
        .map(|default| match persisted.iter().find(|p| p.id == default.id) {
            Some(stored) => stored.clone(),
            None => {
                added = true;
                default
            }
        })
        .collect();

    for config in persisted {
        if !merged.iter().any(|m| m.id == config.id) {
            merged.push(config);
        }
    }
    (merged, added)
}
