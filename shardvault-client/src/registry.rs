//! Registry files
//!
//! Small JSON documents stored inside the allocation itself, under
//! `/.registry/`. They ride the same erasure-coded pipelines as regular
//! files; `RegistryStore` is the seam that lets the bookkeeping logic be
//! tested without an allocation behind it.
//!
//! The starred registry records the paths the user marked, directly as a
//! set of starred paths.

use crate::allocation::Allocation;
use crate::callbacks::AwaitableCallback;
use crate::download::DownloadRequest;
use crate::upload::UploadRequest;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shardvault_core::{Result, ShardVaultError};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Remote path of the starred-files registry.
pub const STARRED_REGISTRY_PATH: &str = "/.registry/starred.json";

/// Byte-level access to registry documents.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// `Ok(None)` when the document does not exist yet.
    async fn read(&self, remote_path: &str) -> Result<Option<Vec<u8>>>;

    async fn write(&self, remote_path: &str, data: &[u8]) -> Result<()>;

    /// Last modification time in UNIX seconds, 0 when the document does not
    /// exist yet.
    async fn last_modified(&self, remote_path: &str) -> Result<i64>;
}

/// The set of starred remote paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StarredFiles {
    pub files: BTreeSet<String>,
}

impl StarredFiles {
    /// Returns true if the path was not starred before.
    pub fn star(&mut self, path: impl Into<String>) -> bool {
        self.files.insert(path.into())
    }

    /// Returns true if the path was starred.
    pub fn unstar(&mut self, path: &str) -> bool {
        self.files.remove(path)
    }

    pub fn is_starred(&self, path: &str) -> bool {
        self.files.contains(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Typed registry operations over a byte store.
pub struct RegistryClient<S: RegistryStore> {
    store: S,
}

impl<S: RegistryStore> RegistryClient<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Load the starred registry, treating a missing document as empty.
    pub async fn load_starred(&self) -> Result<StarredFiles> {
        match self.store.read(STARRED_REGISTRY_PATH).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| ShardVaultError::Corrupt(format!("starred registry: {}", e))),
            None => Ok(StarredFiles::default()),
        }
    }

    pub async fn save_starred(&self, starred: &StarredFiles) -> Result<()> {
        let json = serde_json::to_vec_pretty(starred)
            .map_err(|e| ShardVaultError::Corrupt(format!("starred registry: {}", e)))?;
        self.store.write(STARRED_REGISTRY_PATH, &json).await
    }

    /// Star one path, persisting the updated registry.
    pub async fn star(&self, path: &str) -> Result<()> {
        let mut starred = self.load_starred().await?;
        if starred.star(path) {
            self.save_starred(&starred).await?;
        }
        Ok(())
    }

    /// Unstar one path, persisting the updated registry.
    pub async fn unstar(&self, path: &str) -> Result<()> {
        let mut starred = self.load_starred().await?;
        if starred.unstar(path) {
            self.save_starred(&starred).await?;
        }
        Ok(())
    }

    /// When the starred registry was last written, 0 if never.
    pub async fn last_update_timestamp(&self) -> Result<i64> {
        self.store.last_modified(STARRED_REGISTRY_PATH).await
    }
}

/// Registry store backed by the allocation's own pipelines. Documents are
/// uploaded and downloaded like any other file, via local spool files.
pub struct AllocationRegistryStore {
    allocation: Arc<Allocation>,
}

impl AllocationRegistryStore {
    pub fn new(allocation: Arc<Allocation>) -> Self {
        Self { allocation }
    }

    fn spool_path(&self, remote_path: &str) -> std::path::PathBuf {
        let name = format!(
            "registry-{}.spool",
            crate::refs::lookup_hash(self.allocation.id(), remote_path)
        );
        self.allocation.core().config.progress_dir.join(name)
    }
}

#[async_trait]
impl RegistryStore for AllocationRegistryStore {
    async fn read(&self, remote_path: &str) -> Result<Option<Vec<u8>>> {
        match self.allocation.file_meta(remote_path).await {
            Ok(_) => {}
            Err(ShardVaultError::MetadataConsensus) => return Ok(None),
            Err(e) => return Err(e),
        }
        let spool = self.spool_path(remote_path);
        let callback = AwaitableCallback::new();
        let mut request = DownloadRequest::new(remote_path, spool.clone());
        request.verify = true;
        self.allocation
            .download_file(request, callback.clone())
            .await?;
        callback
            .wait()
            .await
            .map_err(|e| ShardVaultError::Corrupt(format!("registry read: {}", e)))?;
        let bytes = std::fs::read(&spool)?;
        let _ = std::fs::remove_file(&spool);
        Ok(Some(bytes))
    }

    async fn write(&self, remote_path: &str, data: &[u8]) -> Result<()> {
        let spool = self.spool_path(remote_path);
        std::fs::write(&spool, data)?;
        let request = UploadRequest {
            local_path: spool.clone(),
            remote_path: remote_path.to_string(),
            mime_type: Some("application/json".to_string()),
            encrypt: false,
            is_update: false,
            thumbnail_path: None,
        };
        let callback = AwaitableCallback::new();
        let exists = self.allocation.file_meta(remote_path).await.is_ok();
        let outcome = if exists {
            self.allocation.update_file(request, callback.clone()).await
        } else {
            self.allocation.upload_file(request, callback.clone()).await
        };
        if let Err(e) = outcome {
            let _ = std::fs::remove_file(&spool);
            return Err(e);
        }
        let result = callback
            .wait()
            .await
            .map_err(|e| ShardVaultError::Corrupt(format!("registry write: {}", e)));
        let _ = std::fs::remove_file(&spool);
        result.map(|_| ())
    }

    async fn last_modified(&self, remote_path: &str) -> Result<i64> {
        match self.allocation.file_meta(remote_path).await {
            Ok(meta) => chrono::DateTime::parse_from_rfc3339(&meta.updated_at)
                .map(|t| t.timestamp())
                .map_err(|e| ShardVaultError::Corrupt(format!("updated_at: {}", e))),
            Err(ShardVaultError::MetadataConsensus) => Ok(0),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MemoryStore {
        docs: Mutex<HashMap<String, (Vec<u8>, i64)>>,
        clock: std::sync::atomic::AtomicI64,
    }

    #[async_trait]
    impl RegistryStore for MemoryStore {
        async fn read(&self, remote_path: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.docs.lock().get(remote_path).map(|(d, _)| d.clone()))
        }

        async fn write(&self, remote_path: &str, data: &[u8]) -> Result<()> {
            let stamp = self
                .clock
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                + 1;
            self.docs
                .lock()
                .insert(remote_path.to_string(), (data.to_vec(), stamp));
            Ok(())
        }

        async fn last_modified(&self, remote_path: &str) -> Result<i64> {
            Ok(self
                .docs
                .lock()
                .get(remote_path)
                .map(|(_, stamp)| *stamp)
                .unwrap_or(0))
        }
    }

    #[tokio::test]
    async fn test_missing_registry_is_empty() {
        let client = RegistryClient::new(MemoryStore::default());
        let starred = client.load_starred().await.unwrap();
        assert!(starred.is_empty());
    }

    #[tokio::test]
    async fn test_star_unstar_roundtrip() {
        let client = RegistryClient::new(MemoryStore::default());
        client.star("/a.txt").await.unwrap();
        client.star("/b.txt").await.unwrap();
        client.unstar("/a.txt").await.unwrap();
        let starred = client.load_starred().await.unwrap();
        assert!(!starred.is_starred("/a.txt"));
        assert!(starred.is_starred("/b.txt"));
        assert_eq!(starred.len(), 1);
    }

    #[tokio::test]
    async fn test_star_is_idempotent() {
        let client = RegistryClient::new(MemoryStore::default());
        client.star("/a.txt").await.unwrap();
        client.star("/a.txt").await.unwrap();
        assert_eq!(client.load_starred().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_last_update_timestamp() {
        let client = RegistryClient::new(MemoryStore::default());
        assert_eq!(client.last_update_timestamp().await.unwrap(), 0);
        client.star("/a.txt").await.unwrap();
        let first = client.last_update_timestamp().await.unwrap();
        assert!(first > 0);
        client.star("/b.txt").await.unwrap();
        assert!(client.last_update_timestamp().await.unwrap() > first);
    }

    #[tokio::test]
    async fn test_corrupt_registry_surfaces() {
        let store = MemoryStore::default();
        store.write(STARRED_REGISTRY_PATH, b"not json").await.unwrap();
        let client = RegistryClient::new(store);
        assert!(matches!(
            client.load_starred().await,
            Err(ShardVaultError::Corrupt(_))
        ));
    }
}
