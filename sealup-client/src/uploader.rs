//! Single-part upload with retries, deadlines and abort on failure

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use sealup_core::*;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, warn};

use crate::retry::{with_deadline, with_retry};
use crate::session::verify_echo;
use crate::{Result, SessionState, UploadError, UploadSession};

/// Uploads parts of a session
#[derive(Debug, Clone)]
pub struct PartUploader {
    retry: RetryPolicy,
    timeout: Duration,
}

impl PartUploader {
    pub fn new(config: &UploadConfig) -> Self {
        Self::with_policy(config.retry.clone(), config.timeouts.upload_part())
    }

    pub fn with_policy(retry: RetryPolicy, timeout: Duration) -> Self {
        PartUploader { retry, timeout }
    }

    /// Upload one part and record it in the session
    ///
    /// The part must carry the key the session was initiated with. Each
    /// attempt runs under its own deadline and retryable failures are
    /// retried with the same part number and body. An unrecoverable failure
    /// aborts the session before `PartFailed` is returned. A part finishing
    /// after the session closed is discarded with `SessionClosed`.
    pub async fn upload_part(
        &self,
        session: &UploadSession,
        part_number: u32,
        body: Bytes,
        key: Option<&EncryptionKey>,
    ) -> Result<PartResult> {
        let part_number =
            PartNumber::new(part_number).map_err(|e| UploadError::InvalidPart(e.to_string()))?;
        if body.is_empty() {
            return Err(UploadError::InvalidPart(format!(
                "part {} has an empty body",
                part_number
            )));
        }

        let guard = session.begin_part()?;
        let upload_id = guard.upload_id().clone();
        let outcome = self.send(session, &upload_id, part_number, body, key).await;
        drop(guard);

        match outcome {
            Ok(result) => Ok(result),
            Err(e @ UploadError::SessionClosed { .. }) => Err(e),
            Err(e) => {
                let state = session.state();
                if matches!(state, SessionState::Aborting | SessionState::Aborted) {
                    debug!(
                        "Discarding failed part {} of aborted upload {}: {}",
                        part_number, upload_id, e
                    );
                    return Err(UploadError::SessionClosed { state });
                }

                warn!("Part {} of upload {} failed: {}; aborting", part_number, upload_id, e);
                let cleanup = session.abort_after_failure().await;
                Err(UploadError::PartFailed {
                    part_number,
                    source: Box::new(e),
                    cleanup,
                })
            }
        }
    }

    async fn send(
        &self,
        session: &UploadSession,
        upload_id: &UploadId,
        part_number: PartNumber,
        body: Bytes,
        key: Option<&EncryptionKey>,
    ) -> Result<PartResult> {
        session.check_key(key)?;

        let req = UploadPartRequest {
            bucket: session.bucket().clone(),
            key: session.key().clone(),
            upload_id: upload_id.clone(),
            part_number,
            checksum_sha256: Some(BASE64.encode(Sha256::digest(&body))),
            body,
            sse: key.map(EncryptionKey::headers),
        };
        let size = req.body.len() as u64;

        debug!("Uploading part {} of {} ({} bytes)", part_number, upload_id, size);
        let resp = with_retry(&self.retry, "upload_part", || {
            with_deadline(self.timeout, session.storage().upload_part(&req))
        })
        .await
        .map_err(UploadError::from_backend)?;
        verify_echo(key, resp.sse_key_md5.as_deref())?;

        let result = PartResult {
            part_number,
            etag: resp.etag,
            size,
        };
        session.record_part(result.clone())?;
        Ok(result)
    }
}
