//! Upload session state machine
//!
//! `Created -> Initiated -> PartsInFlight -> Completing -> Completed`, or
//! `Initiated/PartsInFlight -> Aborting -> Aborted`. Transitions only move
//! forward; a completion rejected by the backend falls through to `Aborting`.

use parking_lot::Mutex;
use sealup_core::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::retry::{with_deadline, with_retry};
use crate::{Cleanup, Result, UploadError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Initiated,
    PartsInFlight,
    Completing,
    Completed,
    Aborting,
    Aborted,
}

impl SessionState {
    /// Parts may be uploaded and recorded
    pub fn is_open(self) -> bool {
        matches!(self, SessionState::Initiated | SessionState::PartsInFlight)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Aborted)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Created => "created",
            SessionState::Initiated => "initiated",
            SessionState::PartsInFlight => "parts in flight",
            SessionState::Completing => "completing",
            SessionState::Completed => "completed",
            SessionState::Aborting => "aborting",
            SessionState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

struct Inner {
    state: SessionState,
    initiating: bool,
    upload_id: Option<UploadId>,
    parts: BTreeMap<PartNumber, PartResult>,
    in_flight: usize,
}

/// One logical multipart upload
pub struct UploadSession {
    storage: Arc<dyn StorageClient>,
    config: UploadConfig,
    bucket: BucketId,
    key: ObjectKey,
    sse: Option<EncryptionKey>,
    inner: Mutex<Inner>,
    // Settled by the single backend abort; every abort caller shares it
    abort_outcome: OnceCell<Cleanup>,
}

impl UploadSession {
    pub fn new(
        storage: Arc<dyn StorageClient>,
        config: UploadConfig,
        bucket: BucketId,
        key: ObjectKey,
        sse: Option<EncryptionKey>,
    ) -> Self {
        UploadSession {
            storage,
            config,
            bucket,
            key,
            sse,
            inner: Mutex::new(Inner {
                state: SessionState::Created,
                initiating: false,
                upload_id: None,
                parts: BTreeMap::new(),
                in_flight: 0,
            }),
            abort_outcome: OnceCell::new(),
        }
    }

    pub fn bucket(&self) -> &BucketId {
        &self.bucket
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    /// Key bound to the upload at initiate
    pub fn encryption_key(&self) -> Option<&EncryptionKey> {
        self.sse.as_ref()
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Backend-assigned id, known once initiate succeeded
    pub fn upload_id(&self) -> Option<UploadId> {
        self.inner.lock().upload_id.clone()
    }

    /// Recorded parts in part-number order
    pub fn parts(&self) -> Vec<PartResult> {
        self.inner.lock().parts.values().cloned().collect()
    }

    pub fn recorded_bytes(&self) -> u64 {
        self.inner.lock().parts.values().map(|p| p.size).sum()
    }

    /// Outcome of the abort, once one has run
    pub fn cleanup(&self) -> Option<Cleanup> {
        self.abort_outcome.get().cloned()
    }

    pub(crate) fn storage(&self) -> &Arc<dyn StorageClient> {
        &self.storage
    }

    /// Check that a part carries the key the upload was initiated with
    pub fn check_key(&self, key: Option<&EncryptionKey>) -> Result<()> {
        match (self.sse.as_ref(), key) {
            (None, None) => Ok(()),
            (Some(bound), Some(key)) if bound.fingerprint().matches(key.fingerprint().as_str()) => {
                Ok(())
            }
            (bound, key) => Err(UploadError::KeyMismatch(format!(
                "part carries key {} but the upload was initiated with {}",
                describe_key(key),
                describe_key(bound)
            ))),
        }
    }

    /// Start the backend upload
    ///
    /// A failed initiate closes the session; there is no backend upload to
    /// abort. If the backend echoes a key fingerprint other than ours the
    /// fresh upload is aborted and `KeyMismatch` returned.
    pub async fn initiate(&self) -> Result<UploadId> {
        {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Created || inner.initiating {
                return Err(closed(inner.state));
            }
            inner.initiating = true;
        }

        let req = InitiateRequest {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            sse: self.sse.as_ref().map(EncryptionKey::headers),
        };
        let timeout = self.config.timeouts.initiate();

        debug!("Initiating upload for {}/{}", self.bucket, self.key);
        let result = with_retry(&self.config.retry, "initiate", || {
            with_deadline(timeout, self.storage.initiate(&req))
        })
        .await;

        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                self.inner.lock().state = SessionState::Aborted;
                let _ = self.abort_outcome.set(Cleanup::NotStarted);
                warn!("Initiate for {}/{} failed: {}", self.bucket, self.key, e);
                return Err(UploadError::from_backend(e));
            }
        };

        let aborted_meanwhile = {
            let mut inner = self.inner.lock();
            inner.upload_id = Some(resp.upload_id.clone());
            if inner.state == SessionState::Created {
                inner.state = SessionState::Initiated;
                false
            } else {
                true
            }
        };

        if aborted_meanwhile {
            // abort() ran while initiate was in flight and settled as NotStarted
            let cleanup = self.release(Some(resp.upload_id)).await;
            debug!("Released upload initiated after abort: {}", cleanup);
            return Err(closed(SessionState::Aborted));
        }

        info!(
            "Initiated upload {} for {}/{} (sse-c: {})",
            resp.upload_id,
            self.bucket,
            self.key,
            self.sse.is_some()
        );

        if let Err(e) = verify_echo(self.sse.as_ref(), resp.sse_key_md5.as_deref()) {
            warn!("Upload {}: {}; aborting", resp.upload_id, e);
            self.abort_after_failure().await;
            return Err(e);
        }

        Ok(resp.upload_id)
    }

    /// Register a part upload; the guard keeps `complete` out until dropped
    pub(crate) fn begin_part(&self) -> Result<InFlightGuard<'_>> {
        let mut inner = self.inner.lock();
        if !inner.state.is_open() {
            return Err(closed(inner.state));
        }

        let upload_id = inner.upload_id.clone().ok_or(closed(inner.state))?;
        inner.state = SessionState::PartsInFlight;
        inner.in_flight += 1;

        Ok(InFlightGuard {
            session: self,
            upload_id,
        })
    }

    /// Record a finished part
    ///
    /// Recording the same part number with the same ETag again is a no-op.
    pub fn record_part(&self, result: PartResult) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.state.is_open() {
            debug!(
                "Discarding part {} recorded on a {} session",
                result.part_number, inner.state
            );
            return Err(closed(inner.state));
        }

        match inner.parts.get(&result.part_number) {
            Some(existing) if existing.etag == result.etag => return Ok(()),
            Some(existing) => {
                return Err(UploadError::DuplicatePart {
                    part_number: result.part_number,
                    existing: existing.etag.clone(),
                    received: result.etag,
                })
            }
            None => {}
        }

        debug!("Recorded part {} ({} bytes)", result.part_number, result.size);
        inner.state = SessionState::PartsInFlight;
        inner.parts.insert(result.part_number, result);
        Ok(())
    }

    /// Finalize the upload from parts `1..=total_parts`
    ///
    /// Validation failures leave the session untouched. A backend rejection
    /// aborts the upload and is returned as `CompletionFailed`. When that
    /// abort finds the upload already gone, an earlier attempt may have
    /// published the object and `CompletionUnknown` is returned instead.
    pub async fn complete(&self, total_parts: u32) -> Result<CompletedUpload> {
        let (upload_id, parts) = {
            let mut inner = self.inner.lock();
            if !inner.state.is_open() {
                return Err(closed(inner.state));
            }
            if inner.in_flight > 0 {
                return Err(UploadError::PartsInFlight(inner.in_flight));
            }
            if total_parts == 0 || total_parts > PartNumber::MAX {
                return Err(UploadError::InvalidPart(format!(
                    "part count must be between 1 and {}, got {}",
                    PartNumber::MAX,
                    total_parts
                )));
            }

            let recorded: BTreeSet<u32> = inner.parts.keys().map(|p| p.get()).collect();
            let missing: Vec<u32> = (1..=total_parts).filter(|n| !recorded.contains(n)).collect();
            if !missing.is_empty() {
                return Err(UploadError::IncompleteUpload { missing });
            }

            if let Some(beyond) = inner.parts.keys().find(|p| p.get() > total_parts) {
                return Err(UploadError::PartOutOfRange {
                    part_number: *beyond,
                    total: total_parts,
                });
            }

            let upload_id = inner.upload_id.clone().ok_or(closed(inner.state))?;
            inner.state = SessionState::Completing;
            (upload_id, inner.parts.values().cloned().collect::<Vec<_>>())
        };

        let req = CompleteRequest {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            upload_id: upload_id.clone(),
            parts: parts.iter().map(CompletedPart::from).collect(),
            sse: self.sse.as_ref().map(EncryptionKey::headers),
        };
        let timeout = self.config.timeouts.complete();

        let result = with_retry(&self.config.retry, "complete", || {
            with_deadline(timeout, self.storage.complete(&req))
        })
        .await;

        match result {
            Ok(resp) => {
                self.inner.lock().state = SessionState::Completed;
                let size = parts.iter().map(|p| p.size).sum();
                info!(
                    "Completed upload {} as {}/{} version {} ({} parts, {} bytes)",
                    upload_id,
                    self.bucket,
                    self.key,
                    resp.version,
                    parts.len(),
                    size
                );

                Ok(CompletedUpload {
                    upload_id,
                    version: resp.version,
                    etag: resp.etag,
                    size,
                    parts,
                })
            }
            Err(e) => {
                warn!("Completion of upload {} rejected: {}; aborting", upload_id, e);
                let cleanup = self.abort_after_failure().await;
                if cleanup == Cleanup::AlreadyGone {
                    warn!(
                        "Upload {} vanished during completion; the object may be published",
                        upload_id
                    );
                    return Err(UploadError::CompletionUnknown {
                        upload_id,
                        source: e,
                    });
                }
                Err(UploadError::CompletionFailed { source: e, cleanup })
            }
        }
    }

    /// Release the backend upload and every part stored for it
    ///
    /// Idempotent: concurrent and repeated callers share the outcome of a
    /// single backend abort. Fails only on a completed session.
    pub async fn abort(&self) -> Result<Cleanup> {
        self.abort_inner(false).await
    }

    /// Abort triggered by a failure; also allowed while completing
    pub(crate) async fn abort_after_failure(&self) -> Cleanup {
        match self.abort_inner(true).await {
            Ok(cleanup) => cleanup,
            Err(e) => {
                debug!("Skipping abort: {}", e);
                Cleanup::NotStarted
            }
        }
    }

    async fn abort_inner(&self, after_failure: bool) -> Result<Cleanup> {
        let upload_id = {
            let mut inner = self.inner.lock();
            let state = inner.state;
            match state {
                SessionState::Completed => return Err(closed(state)),
                SessionState::Completing if !after_failure => return Err(closed(state)),
                SessionState::Created => {
                    inner.state = SessionState::Aborted;
                    drop(inner);
                    let _ = self.abort_outcome.set(Cleanup::NotStarted);
                    return Ok(self.cleanup().unwrap_or(Cleanup::NotStarted));
                }
                SessionState::Aborted => {}
                _ => inner.state = SessionState::Aborting,
            }
            inner.upload_id.clone()
        };

        let cleanup = self
            .abort_outcome
            .get_or_init(|| self.release(upload_id))
            .await
            .clone();

        self.inner.lock().state = SessionState::Aborted;
        Ok(cleanup)
    }

    async fn release(&self, upload_id: Option<UploadId>) -> Cleanup {
        let Some(upload_id) = upload_id else {
            return Cleanup::NotStarted;
        };

        let req = AbortRequest {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            upload_id: upload_id.clone(),
        };
        let timeout = self.config.timeouts.abort();

        let result = with_retry(&self.config.retry, "abort", || {
            with_deadline(timeout, self.storage.abort(&req))
        })
        .await;

        match result {
            Ok(()) => {
                info!("Aborted upload {}", upload_id);
                Cleanup::Aborted
            }
            Err(e) if e.is_no_such_upload() => {
                info!("Upload {} already released by the backend", upload_id);
                Cleanup::AlreadyGone
            }
            Err(e) => {
                error!(
                    "Failed to abort upload {}: {}; its parts may be orphaned",
                    upload_id, e
                );
                Cleanup::AbortFailed(e)
            }
        }
    }
}

impl fmt::Debug for UploadSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("UploadSession")
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("upload_id", &inner.upload_id)
            .field("state", &inner.state)
            .field("parts", &inner.parts.len())
            .finish_non_exhaustive()
    }
}

/// Counts one part upload in flight for as long as it lives
pub(crate) struct InFlightGuard<'a> {
    session: &'a UploadSession,
    upload_id: UploadId,
}

impl InFlightGuard<'_> {
    pub(crate) fn upload_id(&self) -> &UploadId {
        &self.upload_id
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.session.inner.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
    }
}

fn closed(state: SessionState) -> UploadError {
    UploadError::SessionClosed { state }
}

fn describe_key(key: Option<&EncryptionKey>) -> String {
    match key {
        Some(key) => key.fingerprint().to_string(),
        None => "no key".to_string(),
    }
}

/// Compare the fingerprint a backend echoed with the key we sent
pub(crate) fn verify_echo(key: Option<&EncryptionKey>, echoed: Option<&str>) -> Result<()> {
    match (key, echoed) {
        (Some(key), Some(echoed)) if !key.fingerprint().matches(echoed) => {
            Err(UploadError::KeyMismatch(format!(
                "backend echoed key fingerprint {} but the request carried {}",
                echoed,
                key.fingerprint()
            )))
        }
        _ => Ok(()),
    }
}
