//! Reference S3-compatible backend for sealup, persisted with fjall
//!
//! `LocalStore` implements [`sealup_core::StorageClient`] with S3 multipart
//! semantics and SSE-C: parts are encrypted at rest with the customer key and
//! the key fingerprint is checked on every call.

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use sealup_core::*;
use std::path::Path;
use std::sync::Arc;

pub mod bucket;
pub mod seal;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use bucket::*;
pub use store::*;

/// Result type alias for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

pub(crate) fn storage_error(e: impl std::fmt::Display) -> BackendError {
    BackendError::internal(format!("storage error: {}", e))
}

/// Storage engine wrapping a fjall keyspace
#[derive(Clone)]
pub struct StorageEngine {
    keyspace: Arc<Keyspace>,
    registry: Arc<PartitionHandle>,
}

impl StorageEngine {
    /// Create new storage engine at the given path
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let config = Config::new(path);
        let keyspace = config.open().map_err(storage_error)?;
        let registry = keyspace
            .open_partition("buckets", PartitionCreateOptions::default())
            .map_err(storage_error)?;

        Ok(StorageEngine {
            keyspace: Arc::new(keyspace),
            registry: Arc::new(registry),
        })
    }

    /// Create temporary storage engine for testing
    #[cfg(any(test, feature = "test-utils"))]
    pub fn temp() -> Result<(Self, tempfile::TempDir)> {
        let temp_dir = tempfile::tempdir().map_err(storage_error)?;
        let engine = Self::new(temp_dir.path())?;
        Ok((engine, temp_dir))
    }

    /// Register a bucket; creating an existing bucket is a no-op
    pub fn create_bucket(&self, bucket_id: &BucketId) -> Result<()> {
        if self.bucket_exists(bucket_id)? {
            return Ok(());
        }

        let created_at = serde_json::to_vec(&std::time::SystemTime::now()).map_err(storage_error)?;
        self.registry
            .insert(bucket_id.as_str(), created_at)
            .map_err(storage_error)?;
        self.persist()
    }

    pub fn bucket_exists(&self, bucket_id: &BucketId) -> Result<bool> {
        self.registry
            .contains_key(bucket_id.as_str())
            .map_err(storage_error)
    }

    /// Open a registered bucket
    pub fn bucket(&self, bucket_id: &BucketId) -> Result<Bucket> {
        if !self.bucket_exists(bucket_id)? {
            return Err(BackendError::no_such_bucket(bucket_id));
        }
        Bucket::new(self.clone(), bucket_id.clone())
    }

    /// Get the underlying keyspace
    pub(crate) fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    /// Persist all changes to disk
    pub fn persist(&self) -> Result<()> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .map_err(storage_error)
    }
}
