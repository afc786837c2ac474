//! S3 multipart semantics on top of the storage engine

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::Mutex;
use sealup_core::*;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info};

use crate::seal;
use crate::{storage_error, Bucket, ObjectRecord, PartRecord, Result, StorageEngine, UploadRecord};

/// S3 minimum size for every part except the last one
pub const DEFAULT_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Summary of a stored object
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub version: ObjectVersion,
    pub etag: ETag,
    pub size: u64,
    pub part_count: usize,
    pub sse_key_md5: Option<String>,
}

/// Local object store with SSE-C multipart uploads
#[derive(Clone)]
pub struct LocalStore {
    engine: StorageEngine,
    min_part_size: u64,
    // Serializes state transitions of uploads (part writes, complete, abort)
    lock: Arc<Mutex<()>>,
}

impl LocalStore {
    pub fn new(engine: StorageEngine) -> Self {
        LocalStore {
            engine,
            min_part_size: DEFAULT_MIN_PART_SIZE,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Open a store at the given directory
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(StorageEngine::new(path)?))
    }

    /// Create temporary store for testing
    #[cfg(any(test, feature = "test-utils"))]
    pub fn temp() -> Result<(Self, tempfile::TempDir)> {
        let (engine, temp) = StorageEngine::temp()?;
        Ok((Self::new(engine), temp))
    }

    /// Override the minimum size of non-final parts
    pub fn with_min_part_size(mut self, min_part_size: u64) -> Self {
        self.min_part_size = min_part_size;
        self
    }

    pub fn engine(&self) -> &StorageEngine {
        &self.engine
    }

    pub fn create_bucket(&self, bucket_id: &BucketId) -> Result<()> {
        self.engine.create_bucket(bucket_id)?;
        info!("Created bucket {}", bucket_id);
        Ok(())
    }

    pub fn bucket_exists(&self, bucket_id: &BucketId) -> Result<bool> {
        self.engine.bucket_exists(bucket_id)
    }

    /// In-progress uploads of a bucket
    pub fn list_uploads(&self, bucket_id: &BucketId) -> Result<Vec<UploadSummary>> {
        let bucket = self.engine.bucket(bucket_id)?;
        Ok(bucket
            .uploads()?
            .into_iter()
            .map(|u| UploadSummary {
                upload_id: u.upload_id,
                key: u.key,
                encrypted: u.sse_key_md5.is_some(),
                initiated_at: u.initiated_at,
            })
            .collect())
    }

    /// Parts uploaded so far for an in-progress upload
    pub fn list_parts(
        &self,
        bucket_id: &BucketId,
        upload_id: &UploadId,
    ) -> Result<Vec<PartResult>> {
        let bucket = self.engine.bucket(bucket_id)?;
        if bucket.get_upload(upload_id)?.is_none() {
            return Err(BackendError::no_such_upload(upload_id));
        }

        Ok(bucket
            .parts(upload_id)?
            .into_iter()
            .map(|p| PartResult {
                part_number: p.part_number,
                etag: p.etag,
                size: p.size,
            })
            .collect())
    }

    pub fn object_info(&self, bucket_id: &BucketId, key: &ObjectKey) -> Result<ObjectInfo> {
        let object = self.load_object(&self.engine.bucket(bucket_id)?, key)?;
        Ok(ObjectInfo {
            version: object.version,
            etag: object.etag,
            size: object.size,
            part_count: object.parts.len(),
            sse_key_md5: object.sse_key_md5,
        })
    }

    /// Read back a finished object, decrypting it with the customer key
    pub fn get_object(
        &self,
        bucket_id: &BucketId,
        key: &ObjectKey,
        sse: Option<&SseCustomerHeaders>,
    ) -> Result<Vec<u8>> {
        let bucket = self.engine.bucket(bucket_id)?;
        let object = self.load_object(&bucket, key)?;
        let customer_key = verify_customer_key(object.sse_key_md5.as_deref(), sse)?;

        let mut data = Vec::with_capacity(object.size as usize);
        for part in &object.parts {
            let stored = bucket
                .get_part_data(&object.upload_id, part.part_number)?
                .ok_or_else(|| {
                    BackendError::internal(format!("missing data for part {}", part.part_number))
                })?;

            let plaintext = match (&customer_key, &part.nonce) {
                (Some(k), Some(nonce)) => seal::open(k, nonce, &stored)?,
                (None, None) => stored,
                _ => {
                    return Err(BackendError::internal(format!(
                        "part {} encryption state is inconsistent",
                        part.part_number
                    )))
                }
            };

            if ContentHash::new(&plaintext).to_hex() != part.etag.as_str() {
                return Err(BackendError::internal(format!(
                    "part {} failed integrity check",
                    part.part_number
                )));
            }
            data.extend(plaintext);
        }

        Ok(data)
    }

    fn load_object(&self, bucket: &Bucket, key: &ObjectKey) -> Result<ObjectRecord> {
        bucket.get_object(key)?.ok_or_else(|| {
            BackendError::status(
                404,
                codes::NO_SUCH_KEY,
                format!("object '{}' does not exist", key),
            )
        })
    }

    fn load_upload(
        &self,
        bucket: &Bucket,
        upload_id: &UploadId,
        key: &ObjectKey,
    ) -> Result<UploadRecord> {
        match bucket.get_upload(upload_id)? {
            Some(record) if &record.key == key => Ok(record),
            _ => Err(BackendError::no_such_upload(upload_id)),
        }
    }

    fn initiate_upload(&self, req: &InitiateRequest) -> Result<InitiateResponse> {
        let bucket = self.engine.bucket(&req.bucket)?;

        let sse_key_md5 = match &req.sse {
            Some(headers) => Some(decode_headers(headers)?.fingerprint().as_str().to_string()),
            None => None,
        };

        let record = UploadRecord {
            upload_id: UploadId::new(ulid::Ulid::new().to_string()),
            key: req.key.clone(),
            sse_key_md5: sse_key_md5.clone(),
            initiated_at: SystemTime::now(),
        };
        bucket.put_upload(&record)?;

        info!(
            "Initiated upload {} for {}/{} (sse-c: {})",
            record.upload_id,
            req.bucket,
            req.key,
            sse_key_md5.is_some()
        );

        Ok(InitiateResponse {
            upload_id: record.upload_id,
            sse_key_md5,
        })
    }

    fn store_part(&self, req: &UploadPartRequest) -> Result<UploadPartResponse> {
        let bucket = self.engine.bucket(&req.bucket)?;

        if let Some(expected) = &req.checksum_sha256 {
            let actual = BASE64.encode(Sha256::digest(&req.body));
            if &actual != expected {
                return Err(BackendError::status(
                    400,
                    codes::BAD_DIGEST,
                    format!("checksum mismatch for part {}", req.part_number),
                ));
            }
        }

        let _guard = self.lock.lock();
        let upload = self.load_upload(&bucket, &req.upload_id, &req.key)?;
        let customer_key = verify_customer_key(upload.sse_key_md5.as_deref(), req.sse.as_ref())?;

        let etag = ETag::new(ContentHash::new(&req.body).to_hex());
        let (nonce, stored) = match &customer_key {
            Some(k) => {
                let (nonce, ciphertext) = seal::seal(k, &req.body)?;
                (Some(nonce), ciphertext)
            }
            None => (None, req.body.to_vec()),
        };

        let record = PartRecord {
            part_number: req.part_number,
            etag: etag.clone(),
            size: req.body.len() as u64,
            nonce,
        };
        bucket.put_part(&req.upload_id, &record, &stored)?;

        debug!(
            "Stored part {} of upload {} ({} bytes)",
            req.part_number,
            req.upload_id,
            record.size
        );

        Ok(UploadPartResponse {
            etag,
            sse_key_md5: upload.sse_key_md5,
        })
    }

    fn complete_upload(&self, req: &CompleteRequest) -> Result<CompleteResponse> {
        let bucket = self.engine.bucket(&req.bucket)?;

        let _guard = self.lock.lock();
        let upload = self.load_upload(&bucket, &req.upload_id, &req.key)?;
        verify_customer_key(upload.sse_key_md5.as_deref(), req.sse.as_ref())?;

        if req.parts.is_empty() {
            return Err(BackendError::status(
                400,
                codes::INVALID_REQUEST,
                "you must specify at least one part",
            ));
        }

        if req.parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(BackendError::status(
                400,
                codes::INVALID_PART_ORDER,
                "parts must be listed in ascending order",
            ));
        }

        let mut parts = Vec::with_capacity(req.parts.len());
        for (i, requested) in req.parts.iter().enumerate() {
            let stored = bucket
                .get_part(&req.upload_id, requested.part_number)?
                .filter(|p| p.etag == requested.etag)
                .ok_or_else(|| {
                    BackendError::status(
                        400,
                        codes::INVALID_PART,
                        format!(
                            "part {} was not uploaded or its ETag does not match",
                            requested.part_number
                        ),
                    )
                })?;

            let is_last = i + 1 == req.parts.len();
            if !is_last && stored.size < self.min_part_size {
                return Err(BackendError::status(
                    400,
                    codes::ENTITY_TOO_SMALL,
                    format!(
                        "part {} is {} bytes, minimum is {}",
                        stored.part_number, stored.size, self.min_part_size
                    ),
                ));
            }
            parts.push(stored);
        }

        let object = ObjectRecord {
            upload_id: req.upload_id.clone(),
            version: ObjectVersion::new(),
            etag: multipart_etag(&parts),
            size: parts.iter().map(|p| p.size).sum(),
            sse_key_md5: upload.sse_key_md5,
            parts,
        };
        bucket.commit_object(&req.key, &object)?;

        info!(
            "Completed upload {} as {}/{} ({} parts, {} bytes)",
            req.upload_id,
            req.bucket,
            req.key,
            object.parts.len(),
            object.size
        );

        Ok(CompleteResponse {
            version: object.version,
            etag: object.etag,
        })
    }

    fn abort_upload(&self, req: &AbortRequest) -> Result<()> {
        let bucket = self.engine.bucket(&req.bucket)?;

        let _guard = self.lock.lock();
        self.load_upload(&bucket, &req.upload_id, &req.key)?;
        let discarded = bucket.discard_upload(&req.upload_id)?;

        info!("Aborted upload {} ({} parts discarded)", req.upload_id, discarded);
        Ok(())
    }
}

impl LocalStore {
    /// Run a store operation on the blocking pool; fjall writes and fsyncs block
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&LocalStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(storage_error)?
    }
}

#[async_trait]
impl StorageClient for LocalStore {
    async fn initiate(&self, req: &InitiateRequest) -> Result<InitiateResponse> {
        let req = req.clone();
        self.blocking(move |store| store.initiate_upload(&req)).await
    }

    async fn upload_part(&self, req: &UploadPartRequest) -> Result<UploadPartResponse> {
        let req = req.clone();
        self.blocking(move |store| store.store_part(&req)).await
    }

    async fn complete(&self, req: &CompleteRequest) -> Result<CompleteResponse> {
        let req = req.clone();
        self.blocking(move |store| store.complete_upload(&req)).await
    }

    async fn abort(&self, req: &AbortRequest) -> Result<()> {
        let req = req.clone();
        self.blocking(move |store| store.abort_upload(&req)).await
    }
}

fn decode_headers(headers: &SseCustomerHeaders) -> Result<EncryptionKey> {
    headers
        .decode()
        .map_err(|e| BackendError::status(400, codes::INVALID_ARGUMENT, e.to_string()))
}

/// Check the presented key against the fingerprint bound to an upload or object
fn verify_customer_key(
    bound_md5: Option<&str>,
    presented: Option<&SseCustomerHeaders>,
) -> Result<Option<EncryptionKey>> {
    match (bound_md5, presented) {
        (None, None) => Ok(None),
        (None, Some(_)) => Err(BackendError::status(
            400,
            codes::INVALID_REQUEST,
            "object was not stored with a customer-provided key",
        )),
        (Some(_), None) => Err(BackendError::status(
            400,
            codes::INVALID_REQUEST,
            "the customer-provided key used at initiate is required",
        )),
        (Some(bound), Some(headers)) => {
            let key = decode_headers(headers)?;
            if !key.fingerprint().matches(bound) {
                return Err(BackendError::key_mismatch(
                    "the provided encryption key does not match the key used at initiate",
                ));
            }
            Ok(Some(key))
        }
    }
}

/// `<blake3 over part etags>-<part count>`, mirroring the S3 multipart ETag shape
fn multipart_etag(parts: &[PartRecord]) -> ETag {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part.etag.as_str().as_bytes());
    }
    ETag::new(format!("{}-{}", hasher.finalize().to_hex(), parts.len()))
}
