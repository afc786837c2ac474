//! Upload error types

use sealup_core::{BackendError, CoreError, ETag, PartNumber, UploadId};
use std::fmt;
use thiserror::Error;

use crate::SessionState;

/// Outcome of the backend cleanup attempted after a failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cleanup {
    /// No backend upload existed, nothing to release
    NotStarted,
    /// Backend confirmed the upload and its parts are gone
    Aborted,
    /// Backend no longer knew the upload when the abort arrived
    AlreadyGone,
    /// Abort was attempted and failed; parts may be orphaned backend-side
    AbortFailed(BackendError),
}

impl Cleanup {
    pub fn is_clean(&self) -> bool {
        !matches!(self, Cleanup::AbortFailed(_))
    }
}

impl fmt::Display for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cleanup::NotStarted => write!(f, "nothing to clean up"),
            Cleanup::Aborted => write!(f, "upload aborted"),
            Cleanup::AlreadyGone => write!(f, "upload already gone"),
            Cleanup::AbortFailed(e) => write!(f, "abort failed: {}", e),
        }
    }
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Backend error: {0}")]
    Backend(#[source] BackendError),

    #[error("Encryption key mismatch: {0}")]
    KeyMismatch(String),

    #[error("Part {part_number} already recorded with ETag {existing}, got {received}")]
    DuplicatePart {
        part_number: PartNumber,
        existing: ETag,
        received: ETag,
    },

    #[error("Upload incomplete, missing parts {missing:?}")]
    IncompleteUpload { missing: Vec<u32> },

    #[error("Session is closed ({state})")]
    SessionClosed { state: SessionState },

    #[error("Completion rejected: {source} ({cleanup})")]
    CompletionFailed {
        #[source]
        source: BackendError,
        cleanup: Cleanup,
    },

    #[error("Completion of upload {upload_id} has an unknown outcome: {source}")]
    CompletionUnknown {
        upload_id: UploadId,
        #[source]
        source: BackendError,
    },

    #[error("Part {part_number} failed: {source} ({cleanup})")]
    PartFailed {
        part_number: PartNumber,
        #[source]
        source: Box<UploadError>,
        cleanup: Cleanup,
    },

    #[error("{0} part uploads still in flight")]
    PartsInFlight(usize),

    #[error("Part {part_number} is beyond the declared total of {total} parts")]
    PartOutOfRange { part_number: PartNumber, total: u32 },

    #[error("Invalid part: {0}")]
    InvalidPart(String),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

impl UploadError {
    /// Classify a backend failure, lifting SSE-C key mismatches out of `Backend`
    pub fn from_backend(err: BackendError) -> Self {
        if err.is_key_mismatch() {
            UploadError::KeyMismatch(err.to_string())
        } else {
            UploadError::Backend(err)
        }
    }

    /// Cleanup outcome carried by errors that triggered an abort
    pub fn cleanup(&self) -> Option<&Cleanup> {
        match self {
            UploadError::CompletionFailed { cleanup, .. }
            | UploadError::PartFailed { cleanup, .. } => Some(cleanup),
            _ => None,
        }
    }

    /// The innermost error, looking through `PartFailed`
    pub fn root(&self) -> &UploadError {
        match self {
            UploadError::PartFailed { source, .. } => source.root(),
            other => other,
        }
    }
}
