//! Local thread cache.
//!
//! Two tiers, written together by the sync engine:
//!
//! - SQLite rows with the latest-message projection of each thread, used for listing
//! - A blob store holding the full serialized thread, read on demand
//!
//! SQLite work runs through `tokio::task::spawn_blocking`.

pub mod blob;
mod database;
pub mod queries;
mod schema;

pub use blob::{thread_blob_key, BlobError, BlobStore, FsBlobStore, MemoryBlobStore};
pub use database::{Database, DatabaseError, Result};
pub use queries::threads::{ThreadQuery, ThreadRow};

use std::sync::Arc;

use crate::config::StorageSettings;

/// Cache database plus blob store.
#[derive(Clone)]
pub struct StorageLayer {
    db: Database,
    blobs: Arc<dyn BlobStore>,
}

impl StorageLayer {
    /// Opens the database file and blob directory named in the settings.
    pub async fn open(settings: &StorageSettings) -> Result<Self> {
        let db = Database::open(&settings.database_path).await?;
        let blobs = Arc::new(FsBlobStore::new(&settings.blob_dir));
        tracing::info!(
            database = %settings.database_path.display(),
            blobs = %settings.blob_dir.display(),
            "storage opened"
        );
        Ok(Self { db, blobs })
    }

    /// In-memory database and blob store.
    pub async fn in_memory() -> Result<Self> {
        Ok(Self {
            db: Database::open_in_memory().await?,
            blobs: Arc::new(MemoryBlobStore::new()),
        })
    }

    pub fn new(db: Database, blobs: Arc<dyn BlobStore>) -> Self {
        Self { db, blobs }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }
}

impl std::fmt::Debug for StorageLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageLayer")
            .field("db", &self.db)
            .finish_non_exhaustive()
    }
}
