//! API key storage.
//!
//! Keys live in a [`SecretStore`] keyed by service id and are read through a
//! moka cache owned by [`CredentialManager`]. Nothing else holds keys.

use crate::error::CredentialError;
use crate::service::{ServiceConfiguration, ServiceSnapshot};
use async_trait::async_trait;
use moka::future::Cache;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Backend that persists secrets.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<String>, CredentialError>;
    async fn set(&self, id: &str, key: &str) -> Result<(), CredentialError>;
    /// Returns `CredentialError::NotFound` when nothing is stored for `id`.
    async fn delete(&self, id: &str) -> Result<(), CredentialError>;
}

/// Secrets kept in process memory only.
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, id: &str) -> Result<Option<String>, CredentialError> {
        Ok(self.secrets.lock().await.get(id).cloned())
    }

    async fn set(&self, id: &str, key: &str) -> Result<(), CredentialError> {
        self.secrets.lock().await.insert(id.to_string(), key.to_string());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), CredentialError> {
        self.secrets
            .lock()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or(CredentialError::NotFound)
    }
}

/// Secrets persisted as a JSON map, readable only by the owner on unix.
pub struct FileSecretStore {
    path: PathBuf,
    secrets: Mutex<HashMap<String, String>>,
}

impl FileSecretStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, CredentialError> {
        let path = path.into();
        let secrets = match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => HashMap::new(),
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| CredentialError::Decode(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(CredentialError::StoreUnavailable(e.to_string())),
        };
        Ok(Self {
            path,
            secrets: Mutex::new(secrets),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, secrets: &HashMap<String, String>) -> Result<(), CredentialError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CredentialError::StoreUnavailable(e.to_string()))?;
        }
        let content = serde_json::to_string_pretty(secrets)
            .map_err(|e| CredentialError::Encode(e.to_string()))?;
        let unavailable = |e: std::io::Error| CredentialError::StoreUnavailable(e.to_string());

        // Written owner-only to a sibling file, then renamed over the target.
        let staging = self.path.with_extension("json.tmp");
        match tokio::fs::remove_file(&staging).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(unavailable(e)),
            _ => {}
        }
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(&staging).await.map_err(unavailable)?;
        file.write_all(content.as_bytes()).await.map_err(unavailable)?;
        file.sync_all().await.map_err(unavailable)?;
        drop(file);

        tokio::fs::rename(&staging, &self.path).await.map_err(unavailable)
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn get(&self, id: &str) -> Result<Option<String>, CredentialError> {
        Ok(self.secrets.lock().await.get(id).cloned())
    }

    async fn set(&self, id: &str, key: &str) -> Result<(), CredentialError> {
        let mut secrets = self.secrets.lock().await;
        let mut next = secrets.clone();
        next.insert(id.to_string(), key.to_string());
        self.persist(&next).await?;
        *secrets = next;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), CredentialError> {
        let mut secrets = self.secrets.lock().await;
        if !secrets.contains_key(id) {
            return Err(CredentialError::NotFound);
        }
        let mut next = secrets.clone();
        next.remove(id);
        self.persist(&next).await?;
        *secrets = next;
        Ok(())
    }
}

/// Cached, read-mostly access to API keys.
#[derive(Clone)]
pub struct CredentialManager {
    store: Arc<dyn SecretStore>,
    cache: Cache<String, Option<String>>,
    /// Held across cache misses and writes so a slow load never caches a replaced key.
    write_lock: Arc<Mutex<()>>,
}

impl CredentialManager {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self {
            store,
            cache: Cache::builder().max_capacity(1024).build(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Manager over an in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemorySecretStore::new()))
    }

    pub async fn api_key(&self, service_id: &str) -> Result<Option<String>, CredentialError> {
        if let Some(cached) = self.cache.get(service_id).await {
            return Ok(cached);
        }
        let _guard = self.write_lock.lock().await;
        if let Some(cached) = self.cache.get(service_id).await {
            return Ok(cached);
        }
        let key = self.store.get(service_id).await?;
        self.cache.insert(service_id.to_string(), key.clone()).await;
        Ok(key)
    }

    /// Store a key, or remove it with `None`. Only this service's cache entry changes.
    pub async fn set_api_key(
        &self,
        service_id: &str,
        api_key: Option<&str>,
    ) -> Result<(), CredentialError> {
        let _guard = self.write_lock.lock().await;
        match api_key {
            Some(key) => {
                self.store.set(service_id, key).await?;
                self.cache
                    .insert(service_id.to_string(), Some(key.to_string()))
                    .await;
            }
            None => {
                match self.store.delete(service_id).await {
                    Ok(()) | Err(CredentialError::NotFound) => {}
                    Err(e) => return Err(e),
                }
                self.cache.invalidate(service_id).await;
            }
        }
        tracing::debug!(service = %service_id, stored = api_key.is_some(), "API key updated");
        Ok(())
    }

    pub async fn has_api_key(&self, service_id: &str) -> Result<bool, CredentialError> {
        Ok(self
            .api_key(service_id)
            .await?
            .is_some_and(|key| !key.is_empty()))
    }

    /// Configuration plus its current key, for change detection.
    pub async fn snapshot(
        &self,
        configuration: &ServiceConfiguration,
    ) -> Result<ServiceSnapshot, CredentialError> {
        let api_key = self.api_key(&configuration.id).await?;
        Ok(ServiceSnapshot {
            configuration: configuration.clone(),
            api_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ProtocolKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Store that counts reads so cache behavior is observable.
    #[derive(Default)]
    struct CountingStore {
        inner: MemorySecretStore,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl SecretStore for CountingStore {
        async fn get(&self, id: &str) -> Result<Option<String>, CredentialError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get(id).await
        }
        async fn set(&self, id: &str, key: &str) -> Result<(), CredentialError> {
            self.inner.set(id, key).await
        }
        async fn delete(&self, id: &str) -> Result<(), CredentialError> {
            self.inner.delete(id).await
        }
    }

    /// Store whose first read parks after fetching, until released.
    struct ParkingStore {
        inner: MemorySecretStore,
        parked: tokio::sync::Notify,
        release: tokio::sync::Semaphore,
        park_next: std::sync::atomic::AtomicBool,
    }

    impl ParkingStore {
        fn new() -> Self {
            Self {
                inner: MemorySecretStore::new(),
                parked: tokio::sync::Notify::new(),
                release: tokio::sync::Semaphore::new(0),
                park_next: std::sync::atomic::AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl SecretStore for ParkingStore {
        async fn get(&self, id: &str) -> Result<Option<String>, CredentialError> {
            let value = self.inner.get(id).await;
            if self.park_next.swap(false, Ordering::SeqCst) {
                self.parked.notify_one();
                let _permit = self.release.acquire().await;
            }
            value
        }
        async fn set(&self, id: &str, key: &str) -> Result<(), CredentialError> {
            self.inner.set(id, key).await
        }
        async fn delete(&self, id: &str) -> Result<(), CredentialError> {
            self.inner.delete(id).await
        }
    }

    #[tokio::test]
    async fn slow_read_does_not_cache_over_a_newer_key() {
        let store = Arc::new(ParkingStore::new());
        store.inner.set("openai", "sk-old").await.unwrap();
        let manager = CredentialManager::new(store.clone());

        let reader = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.api_key("openai").await })
        };
        store.parked.notified().await;

        let writer = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.set_api_key("openai", Some("sk-new")).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        store.release.add_permits(1);

        assert_eq!(reader.await.unwrap().unwrap().as_deref(), Some("sk-old"));
        writer.await.unwrap().unwrap();
        assert_eq!(manager.api_key("openai").await.unwrap().as_deref(), Some("sk-new"));
    }

    #[tokio::test]
    async fn missing_key_reads_as_none() {
        let manager = CredentialManager::in_memory();
        assert_eq!(manager.api_key("openai").await.unwrap(), None);
        assert!(!manager.has_api_key("openai").await.unwrap());
    }

    #[tokio::test]
    async fn repeated_reads_hit_the_cache() {
        let store = Arc::new(CountingStore::default());
        store.inner.set("openai", "sk-1").await.unwrap();
        let manager = CredentialManager::new(store.clone());

        assert_eq!(manager.api_key("openai").await.unwrap().as_deref(), Some("sk-1"));
        assert_eq!(manager.api_key("openai").await.unwrap().as_deref(), Some("sk-1"));
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deleting_a_key_invalidates_only_that_service() {
        let store = Arc::new(CountingStore::default());
        let manager = CredentialManager::new(store.clone());
        manager.set_api_key("openai", Some("sk-1")).await.unwrap();
        manager.set_api_key("anthropic", Some("sk-ant")).await.unwrap();

        manager.set_api_key("openai", None).await.unwrap();

        assert_eq!(manager.api_key("openai").await.unwrap(), None);
        assert_eq!(manager.api_key("anthropic").await.unwrap().as_deref(), Some("sk-ant"));
        // openai re-read from the store, anthropic served from cache
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deleting_a_missing_key_is_not_an_error() {
        let manager = CredentialManager::in_memory();
        assert!(manager.set_api_key("nobody", None).await.is_ok());
    }

    #[tokio::test]
    async fn snapshot_includes_current_key() {
        let manager = CredentialManager::in_memory();
        let config = ServiceConfiguration::new(
            Some("openai".to_string()),
            "OpenAI",
            ProtocolKind::OpenAi,
            "https://api.openai.com/v1",
        );
        let before = manager.snapshot(&config).await.unwrap();
        manager.set_api_key("openai", Some("sk-2")).await.unwrap();
        let after = manager.snapshot(&config).await.unwrap();

        assert_eq!(before.configuration, after.configuration);
        assert_ne!(before, after);
        assert_eq!(after.api_key.as_deref(), Some("sk-2"));
    }

    #[tokio::test]
    async fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");

        let store = FileSecretStore::open(&path).await.unwrap();
        store.set("openai", "sk-file").await.unwrap();
        drop(store);

        let reopened = FileSecretStore::open(&path).await.unwrap();
        assert_eq!(reopened.get("openai").await.unwrap().as_deref(), Some("sk-file"));

        reopened.delete("openai").await.unwrap();
        assert_eq!(reopened.delete("openai").await, Err(CredentialError::NotFound));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_store_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        let store = FileSecretStore::open(&path).await.unwrap();
        store.set("openai", "sk").await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_store_replaces_a_world_readable_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        std::fs::write(&path, "{}").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let store = FileSecretStore::open(&path).await.unwrap();
        store.set("openai", "sk").await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(!path.with_extension("json.tmp").exists());
        let saved: HashMap<String, String> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["openai"], "sk");
    }

    #[tokio::test]
    async fn corrupt_file_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        std::fs::write(&path, "not json").unwrap();

        let result = FileSecretStore::open(&path).await;
        assert!(matches!(result, Err(CredentialError::Decode(_))));
    }
}
