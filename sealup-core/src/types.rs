//! Core data types for sealup

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::{CoreError, Result};

/// Bucket name, validated against the subset of S3 naming rules the
/// reference backend can map onto partition names
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketId(String);

impl BucketId {
    /// Create a new bucket ID with validation
    pub fn new(name: &str) -> Result<Self> {
        if name.len() < 3 || name.len() > 63 {
            return Err(CoreError::InvalidBucketName(format!(
                "'{}' must be between 3 and 63 characters",
                name
            )));
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(CoreError::InvalidBucketName(format!(
                "invalid characters in '{}'",
                name
            )));
        }

        if name.starts_with('-') || name.ends_with('-') {
            return Err(CoreError::InvalidBucketName(format!(
                "'{}' must start and end with a letter or digit",
                name
            )));
        }

        Ok(BucketId(name.to_string()))
    }

    /// Get the bucket name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BucketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Object key within a bucket
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub const MAX_LEN: usize = 1024;

    /// Create a new key with validation
    pub fn new(key: &str) -> Result<Self> {
        if key.is_empty() {
            return Err(CoreError::InvalidKey("empty key".to_string()));
        }

        if key.len() > Self::MAX_LEN {
            return Err(CoreError::InvalidKey(format!(
                "key is {} bytes, limit is {}",
                key.len(),
                Self::MAX_LEN
            )));
        }

        if key.chars().any(|c| c.is_control()) {
            return Err(CoreError::InvalidKey(
                "control characters not allowed".to_string(),
            ));
        }

        Ok(ObjectKey(key.to_string()))
    }

    /// Get the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Part number of a multipart upload, 1-based
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartNumber(u32);

impl PartNumber {
    pub const MIN: u32 = 1;
    pub const MAX: u32 = 10_000;

    pub fn new(n: u32) -> Result<Self> {
        if !(Self::MIN..=Self::MAX).contains(&n) {
            return Err(CoreError::InvalidPartNumber(u64::from(n)));
        }
        Ok(PartNumber(n))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for PartNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque upload identifier assigned by the backend on initiate
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(String);

impl UploadId {
    pub fn new(id: impl Into<String>) -> Self {
        UploadId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backend-assigned identifier for an uploaded part or a finished object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ETag(String);

impl ETag {
    /// Create an ETag, dropping the surrounding quotes HTTP backends send
    pub fn new(tag: impl Into<String>) -> Self {
        ETag(tag.into().trim_matches('"').to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ETag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Object version identifier using ULID for time-ordering
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectVersion(ulid::Ulid);

impl ObjectVersion {
    /// Generate a new version with current timestamp
    pub fn new() -> Self {
        ObjectVersion(ulid::Ulid::new())
    }

    /// Create version from ULID
    pub fn from_ulid(ulid: ulid::Ulid) -> Self {
        ObjectVersion(ulid)
    }

    /// Get timestamp component
    pub fn timestamp(&self) -> u64 {
        self.0.timestamp_ms()
    }
}

impl Default for ObjectVersion {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ObjectVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content hash for part integrity and ETag derivation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Create hash from data using BLAKE3
    pub fn new(data: &[u8]) -> Self {
        let hash = blake3::hash(data);
        ContentHash(hash.into())
    }

    /// Get hash as bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Get hash as hex string
    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }
}

/// Result of a single successful part upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartResult {
    pub part_number: PartNumber,
    pub etag: ETag,
    pub size: u64,
}

/// Part reference sent on completion, in ascending part-number order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: PartNumber,
    pub etag: ETag,
}

impl From<&PartResult> for CompletedPart {
    fn from(part: &PartResult) -> Self {
        CompletedPart {
            part_number: part.part_number,
            etag: part.etag.clone(),
        }
    }
}

/// Outcome of a successfully completed upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedUpload {
    pub upload_id: UploadId,
    pub version: ObjectVersion,
    pub etag: ETag,
    pub size: u64,
    pub parts: Vec<PartResult>,
}

/// In-progress upload as reported by a backend listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSummary {
    pub upload_id: UploadId,
    pub key: ObjectKey,
    pub encrypted: bool,
    pub initiated_at: SystemTime,
}
