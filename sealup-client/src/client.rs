//! High-level upload orchestration

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use sealup_core::*;
use std::sync::Arc;
use tracing::info;

use crate::{PartPlan, PartUploader, Result, UploadError, UploadSession};

/// sealup client
pub struct Client {
    storage: Arc<dyn StorageClient>,
    config: UploadConfig,
    keys: KeyProvider,
}

impl Client {
    /// Create new client with default configuration
    pub fn new(storage: Arc<dyn StorageClient>) -> Self {
        Client {
            storage,
            config: UploadConfig::default(),
            keys: KeyProvider::new(),
        }
    }

    pub fn with_config(storage: Arc<dyn StorageClient>, config: UploadConfig) -> Result<Self> {
        config.validate()?;
        Ok(Client {
            storage,
            config,
            keys: KeyProvider::new(),
        })
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Fresh per-upload customer key
    pub fn generate_key(&self) -> Result<EncryptionKey> {
        Ok(self.keys.generate()?)
    }

    pub fn uploader(&self) -> PartUploader {
        PartUploader::new(&self.config)
    }

    /// Initiate an upload for callers that drive parts themselves
    pub async fn start_upload(
        &self,
        bucket: &BucketId,
        key: &ObjectKey,
        sse: Option<&EncryptionKey>,
    ) -> Result<UploadSession> {
        let session = UploadSession::new(
            self.storage.clone(),
            self.config.clone(),
            bucket.clone(),
            key.clone(),
            sse.cloned(),
        );
        session.initiate().await?;
        Ok(session)
    }

    /// Upload `payload` as a multipart object
    ///
    /// Parts go up concurrently, at most `concurrency` at a time. Every part
    /// upload is joined before completion; the first unrecoverable failure
    /// has already aborted the upload when it is returned.
    pub async fn upload(
        &self,
        bucket: &BucketId,
        key: &ObjectKey,
        payload: Bytes,
        sse: Option<&EncryptionKey>,
    ) -> Result<CompletedUpload> {
        let plan = PartPlan::new(payload.len(), self.config.part_size)?;
        let session = self.start_upload(bucket, key, sse).await?;
        let uploader = self.uploader();

        info!(
            "Uploading {} bytes to {}/{} in {} parts of {} bytes",
            plan.total_len(),
            bucket,
            key,
            plan.part_count(),
            plan.part_size()
        );

        let results: Vec<Result<PartResult>> = stream::iter(plan.parts())
            .map(|span| {
                uploader.upload_part(
                    &session,
                    span.part_number.get(),
                    payload.slice(span.range()),
                    sse,
                )
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        if let Some(err) = first_failure(results) {
            return Err(err);
        }

        session.complete(plan.part_count()).await
    }
}

/// The failure that closed the session, ahead of parts it discarded
fn first_failure(results: Vec<Result<PartResult>>) -> Option<UploadError> {
    let mut discarded = None;
    for result in results {
        match result {
            Ok(_) => {}
            Err(e @ UploadError::SessionClosed { .. }) => {
                discarded.get_or_insert(e);
            }
            Err(e) => return Some(e),
        }
    }
    discarded
}
