//! Storage backend contract
//!
//! The upload engine talks to an object store only through [`StorageClient`].
//! Requests are immutable values; signing, transport and TLS belong to the
//! implementation.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

use crate::{
    BucketId, CompletedPart, ETag, ObjectKey, ObjectVersion, PartNumber, SseCustomerHeaders,
    UploadId,
};

/// Error codes reported by S3-compatible backends
pub mod codes {
    pub const NO_SUCH_BUCKET: &str = "NoSuchBucket";
    pub const NO_SUCH_UPLOAD: &str = "NoSuchUpload";
    pub const NO_SUCH_KEY: &str = "NoSuchKey";
    pub const INVALID_ARGUMENT: &str = "InvalidArgument";
    pub const INVALID_REQUEST: &str = "InvalidRequest";
    pub const INVALID_PART: &str = "InvalidPart";
    pub const INVALID_PART_ORDER: &str = "InvalidPartOrder";
    pub const ENTITY_TOO_SMALL: &str = "EntityTooSmall";
    pub const BAD_DIGEST: &str = "BadDigest";
    pub const KEY_MISMATCH: &str = "SseCustomerKeyMismatch";
    pub const SLOW_DOWN: &str = "SlowDown";
    pub const INTERNAL_ERROR: &str = "InternalError";
}

/// Failure of a single backend call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("{code} ({status}): {message}")]
    Status {
        status: u16,
        code: String,
        message: String,
    },
}

impl BackendError {
    pub fn status(status: u16, code: &str, message: impl Into<String>) -> Self {
        BackendError::Status {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn no_such_bucket(bucket: &BucketId) -> Self {
        Self::status(
            404,
            codes::NO_SUCH_BUCKET,
            format!("bucket '{}' does not exist", bucket),
        )
    }

    pub fn no_such_upload(upload_id: &UploadId) -> Self {
        Self::status(
            404,
            codes::NO_SUCH_UPLOAD,
            format!("upload '{}' does not exist", upload_id),
        )
    }

    pub fn key_mismatch(message: impl Into<String>) -> Self {
        Self::status(400, codes::KEY_MISMATCH, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::status(500, codes::INTERNAL_ERROR, message)
    }

    /// Error code, if the backend returned one
    pub fn code(&self) -> Option<&str> {
        match self {
            BackendError::Status { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Timeouts, network failures, throttling and 5xx are safe to retry with
    /// the same parameters; every other 4xx is surfaced immediately
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Timeout(_) | BackendError::Network(_) => true,
            BackendError::Status { status, .. } => *status == 429 || *status >= 500,
        }
    }

    /// Backend refused the customer key because its fingerprint differs from
    /// the one bound to the upload
    pub fn is_key_mismatch(&self) -> bool {
        self.code() == Some(codes::KEY_MISMATCH)
    }

    pub fn is_no_such_upload(&self) -> bool {
        self.code() == Some(codes::NO_SUCH_UPLOAD)
    }
}

#[derive(Debug, Clone)]
pub struct InitiateRequest {
    pub bucket: BucketId,
    pub key: ObjectKey,
    pub sse: Option<SseCustomerHeaders>,
}

#[derive(Debug, Clone)]
pub struct InitiateResponse {
    pub upload_id: UploadId,
    /// Fingerprint echoed by the backend for SSE-C uploads
    pub sse_key_md5: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploadPartRequest {
    pub bucket: BucketId,
    pub key: ObjectKey,
    pub upload_id: UploadId,
    pub part_number: PartNumber,
    pub body: Bytes,
    /// Base64 SHA-256 of `body`
    pub checksum_sha256: Option<String>,
    pub sse: Option<SseCustomerHeaders>,
}

#[derive(Debug, Clone)]
pub struct UploadPartResponse {
    pub etag: ETag,
    pub sse_key_md5: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompleteRequest {
    pub bucket: BucketId,
    pub key: ObjectKey,
    pub upload_id: UploadId,
    /// Ascending by part number, no gaps
    pub parts: Vec<CompletedPart>,
    pub sse: Option<SseCustomerHeaders>,
}

#[derive(Debug, Clone)]
pub struct CompleteResponse {
    pub version: ObjectVersion,
    pub etag: ETag,
}

#[derive(Debug, Clone)]
pub struct AbortRequest {
    pub bucket: BucketId,
    pub key: ObjectKey,
    pub upload_id: UploadId,
}

/// Network calls against an S3-compatible object store
#[async_trait]
pub trait StorageClient: Send + Sync {
    async fn initiate(&self, req: &InitiateRequest) -> Result<InitiateResponse, BackendError>;

    async fn upload_part(&self, req: &UploadPartRequest)
        -> Result<UploadPartResponse, BackendError>;

    async fn complete(&self, req: &CompleteRequest) -> Result<CompleteResponse, BackendError>;

    async fn abort(&self, req: &AbortRequest) -> Result<(), BackendError>;
}
