//! Large-object store for full threads.
//!
//! Keys are `/`-separated relative paths such as `conn-1/thread.json`.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::domain::{ConnectionId, ThreadId};

/// Errors that can occur during blob operations.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("invalid blob key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for blob operations.
pub type Result<T> = std::result::Result<T, BlobError>;

/// Key under which a full thread is stored.
pub fn thread_blob_key(connection_id: &ConnectionId, thread_id: &ThreadId) -> String {
    format!("{}/{}.json", connection_id, thread_id)
}

/// Byte storage addressed by key.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Writes `data`, replacing any previous value.
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Returns whether something was removed.
    async fn delete(&self, key: &str) -> Result<bool>;
}

/// Checks a key and splits it into path components.
fn key_components(key: &str) -> Result<Vec<&str>> {
    let invalid = || BlobError::InvalidKey(key.to_string());
    if key.is_empty() || key.contains('\\') || key.contains('\0') {
        return Err(invalid());
    }
    let parts: Vec<&str> = key.split('/').collect();
    for part in &parts {
        let mut components = Path::new(part).components();
        let single_normal = matches!(components.next(), Some(Component::Normal(_)))
            && components.next().is_none();
        if part.is_empty() || !single_normal {
            return Err(invalid());
        }
    }
    Ok(parts)
}

/// Files under a root directory, one file per key.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// reader never sees a partial blob.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        Ok(key_components(key)?
            .into_iter()
            .fold(self.root.clone(), |path, part| path.join(part)))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut tmp = path.clone().into_os_string();
        tmp.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        tracing::trace!(key, bytes = data.len(), "blob written");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process store for tests and throwaway caches.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.blobs.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        key_components(key)?;
        self.blobs.write().await.insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        key_components(key)?;
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        key_components(key)?;
        Ok(self.blobs.write().await.remove(key).is_some())
    }
}
