//! Subcommand implementations against a local store

use anyhow::{Context, Result};
use bytes::Bytes;
use sealup_client::Client;
use sealup_core::{
    AbortRequest, BucketId, CompletedUpload, EncryptionKey, KeyProvider, ObjectKey, PartResult,
    StorageClient, UploadConfig, UploadId, UploadSummary,
};
use sealup_engine::LocalStore;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub fn open_store(data_dir: &Path) -> Result<LocalStore> {
    if !data_dir.exists() {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("creating data directory {}", data_dir.display()))?;
        info!("Created data directory: {}", data_dir.display());
    }

    LocalStore::open(data_dir)
        .with_context(|| format!("opening store at {}", data_dir.display()))
}

pub fn generate_key() -> Result<EncryptionKey> {
    Ok(KeyProvider::new().generate()?)
}

/// Parse a base64 customer key given on the command line
pub fn parse_key(encoded: Option<&str>) -> Result<Option<EncryptionKey>> {
    encoded
        .map(|k| EncryptionKey::from_base64(k).context("invalid --sse-key"))
        .transpose()
}

pub fn create_bucket(store: &LocalStore, bucket: &str) -> Result<BucketId> {
    let bucket = BucketId::new(bucket)?;
    store.create_bucket(&bucket)?;
    Ok(bucket)
}

pub async fn upload(
    store: &LocalStore,
    config: UploadConfig,
    bucket: &str,
    key: &str,
    file: &Path,
    sse: Option<&EncryptionKey>,
) -> Result<CompletedUpload> {
    let bucket = BucketId::new(bucket)?;
    let key = ObjectKey::new(key)?;
    let payload = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;

    let client = Client::with_config(Arc::new(store.clone()), config)?;
    let done = client.upload(&bucket, &key, Bytes::from(payload), sse).await?;
    Ok(done)
}

pub fn get(
    store: &LocalStore,
    bucket: &str,
    key: &str,
    sse: Option<&EncryptionKey>,
) -> Result<Vec<u8>> {
    let bucket = BucketId::new(bucket)?;
    let key = ObjectKey::new(key)?;
    let headers = sse.map(EncryptionKey::headers);
    Ok(store.get_object(&bucket, &key, headers.as_ref())?)
}

pub fn list_uploads(store: &LocalStore, bucket: &str) -> Result<Vec<UploadSummary>> {
    Ok(store.list_uploads(&BucketId::new(bucket)?)?)
}

pub fn list_parts(store: &LocalStore, bucket: &str, upload_id: &str) -> Result<Vec<PartResult>> {
    Ok(store.list_parts(&BucketId::new(bucket)?, &UploadId::new(upload_id))?)
}

/// Abort an orphaned upload by id
pub async fn abort(store: &LocalStore, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
    let req = AbortRequest {
        bucket: BucketId::new(bucket)?,
        key: ObjectKey::new(key)?,
        upload_id: UploadId::new(upload_id),
    };
    store
        .abort(&req)
        .await
        .with_context(|| format!("aborting upload {}", upload_id))
}
