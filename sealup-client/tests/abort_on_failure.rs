//! Every unrecoverable failure leaves no upload behind on the backend

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sealup_client::*;
use sealup_core::{
    AbortRequest, BackendError, BucketId, CompleteRequest, CompleteResponse, ETag,
    InitiateRequest, InitiateResponse, KeyProvider, ObjectKey, ObjectVersion, RetryPolicy,
    StorageClient, UploadConfig, UploadId, UploadPartRequest, UploadPartResponse,
};
use sealup_engine::testing::{Call, FaultyStore};
use sealup_engine::LocalStore;
use std::sync::Arc;

/// Backend that accepts any key and echoes no fingerprint
#[derive(Default)]
struct Lenient {
    sent_md5: Mutex<Vec<Option<String>>>,
    completes: Mutex<usize>,
    aborts: Mutex<usize>,
}

#[async_trait]
impl StorageClient for Lenient {
    async fn initiate(
        &self,
        _req: &InitiateRequest,
    ) -> std::result::Result<InitiateResponse, BackendError> {
        Ok(InitiateResponse {
            upload_id: UploadId::new("lenient-upload"),
            sse_key_md5: None,
        })
    }

    async fn upload_part(
        &self,
        req: &UploadPartRequest,
    ) -> std::result::Result<UploadPartResponse, BackendError> {
        self.sent_md5
            .lock()
            .push(req.sse.as_ref().map(|h| h.key_md5.clone()));
        Ok(UploadPartResponse {
            etag: ETag::new(format!("etag-{}", req.part_number)),
            sse_key_md5: None,
        })
    }

    async fn complete(
        &self,
        _req: &CompleteRequest,
    ) -> std::result::Result<CompleteResponse, BackendError> {
        *self.completes.lock() += 1;
        Ok(CompleteResponse {
            version: ObjectVersion::new(),
            etag: ETag::new("object"),
        })
    }

    async fn abort(&self, _req: &AbortRequest) -> std::result::Result<(), BackendError> {
        *self.aborts.lock() += 1;
        Ok(())
    }
}

struct Harness {
    client: Client,
    store: Arc<FaultyStore<LocalStore>>,
    bucket: BucketId,
    key: ObjectKey,
    _temp: tempfile::TempDir,
}

fn harness(retry: RetryPolicy) -> Harness {
    let (store, temp) = LocalStore::temp().unwrap();
    let bucket = BucketId::new("uploads").unwrap();
    store.create_bucket(&bucket).unwrap();
    let store = Arc::new(FaultyStore::new(store.with_min_part_size(1)));

    let config = UploadConfig {
        part_size: 8,
        concurrency: 2,
        retry,
        ..UploadConfig::default()
    };

    Harness {
        client: Client::with_config(store.clone(), config).unwrap(),
        store,
        bucket,
        key: ObjectKey::new("archive.bin").unwrap(),
        _temp: temp,
    }
}

fn quick_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 1,
        multiplier: 1,
    }
}

fn payload() -> Bytes {
    Bytes::from((0u8..40).collect::<Vec<u8>>())
}

#[tokio::test]
async fn first_part_network_error_aborts_exactly_once() {
    let h = harness(RetryPolicy::none());
    let session = h.client.start_upload(&h.bucket, &h.key, None).await.unwrap();
    let upload_id = session.upload_id().unwrap();
    h.store
        .fail_part(1, BackendError::Network("connection reset".to_string()));

    let err = h
        .client
        .uploader()
        .upload_part(&session, 1, Bytes::from_static(b"first part"), None)
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::PartFailed { .. }));
    assert_eq!(err.cleanup(), Some(&Cleanup::Aborted));

    let aborts: Vec<Call> = h
        .store
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Abort { .. }))
        .collect();
    assert_eq!(aborts, vec![Call::Abort { upload_id }]);
    assert_eq!(h.store.complete_calls(), 0);
}

#[tokio::test]
async fn retries_exhausted_then_aborted() {
    let h = harness(quick_retry());
    h.store
        .fail_part(3, BackendError::status(500, "InternalError", "disk on fire"));

    let err = h
        .client
        .upload(&h.bucket, &h.key, payload(), None)
        .await
        .unwrap_err();

    match err {
        UploadError::PartFailed { part_number, .. } => assert_eq!(part_number.get(), 3),
        other => panic!("expected PartFailed, got {:?}", other),
    }
    assert_eq!(h.store.part_calls(3), 3);
    assert_eq!(h.store.abort_calls(), 1);
    assert_eq!(h.store.complete_calls(), 0);
    assert!(h.store.inner().list_uploads(&h.bucket).unwrap().is_empty());
}

#[tokio::test]
async fn key_mismatch_across_parts_aborts() {
    let h = harness(quick_retry());
    let key = KeyProvider::new().generate().unwrap();
    let other = KeyProvider::new().generate().unwrap();

    let session = h
        .client
        .start_upload(&h.bucket, &h.key, Some(&key))
        .await
        .unwrap();
    let uploader = h.client.uploader();

    uploader
        .upload_part(&session, 1, Bytes::from_static(b"part one"), Some(&key))
        .await
        .unwrap();
    let err = uploader
        .upload_part(&session, 2, Bytes::from_static(b"part two"), Some(&other))
        .await
        .unwrap_err();

    assert!(matches!(err.root(), UploadError::KeyMismatch(_)));
    assert_eq!(session.state(), SessionState::Aborted);
    assert_eq!(h.store.part_calls(2), 0);
    assert_eq!(h.store.abort_calls(), 1);

    assert!(matches!(
        session.complete(2).await,
        Err(UploadError::SessionClosed { .. })
    ));
}

#[tokio::test]
async fn rejected_completion_aborts_then_reports() {
    let h = harness(quick_retry());
    h.store
        .fail_complete(BackendError::status(400, "InvalidPart", "etag mismatch"));

    let err = h
        .client
        .upload(&h.bucket, &h.key, payload(), None)
        .await
        .unwrap_err();

    match err {
        UploadError::CompletionFailed { source, cleanup } => {
            assert_eq!(source.code(), Some("InvalidPart"));
            assert_eq!(cleanup, Cleanup::Aborted);
        }
        other => panic!("expected CompletionFailed, got {:?}", other),
    }

    let calls = h.store.calls();
    let complete_at = calls
        .iter()
        .position(|c| matches!(c, Call::Complete { .. }))
        .unwrap();
    let abort_at = calls
        .iter()
        .position(|c| matches!(c, Call::Abort { .. }))
        .unwrap();
    assert!(complete_at < abort_at);
    assert!(h.store.inner().list_uploads(&h.bucket).unwrap().is_empty());
}

#[tokio::test]
async fn abort_failure_does_not_mask_trigger() {
    let h = harness(RetryPolicy::none());
    h.store
        .fail_part(1, BackendError::status(400, "InvalidRequest", "rejected"));
    h.store
        .fail_abort(BackendError::Network("connection refused".to_string()));

    let err = h
        .client
        .upload(&h.bucket, &h.key, payload(), None)
        .await
        .unwrap_err();

    assert!(matches!(err.root(), UploadError::Backend(e) if e.code() == Some("InvalidRequest")));
    assert!(matches!(err.cleanup(), Some(Cleanup::AbortFailed(BackendError::Network(_)))));
    assert_eq!(h.store.abort_calls(), 1);

    // the upload is orphaned backend-side, which list_uploads reveals
    assert_eq!(h.store.inner().list_uploads(&h.bucket).unwrap().len(), 1);
}

#[tokio::test]
async fn failed_initiate_makes_no_abort_call() {
    let h = harness(quick_retry());
    let missing = BucketId::new("missing-bucket").unwrap();

    let err = h
        .client
        .upload(&missing, &h.key, payload(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::Backend(ref e) if e.code() == Some("NoSuchBucket")));
    assert_eq!(h.store.calls(), vec![Call::Initiate]);
}

#[tokio::test]
async fn part_key_is_checked_even_when_backend_is_lenient() {
    let backend = Arc::new(Lenient::default());
    let client = Client::with_config(
        backend.clone(),
        UploadConfig {
            retry: RetryPolicy::none(),
            ..UploadConfig::default()
        },
    )
    .unwrap();
    let key = KeyProvider::new().generate().unwrap();
    let other = KeyProvider::new().generate().unwrap();
    let bucket = BucketId::new("uploads").unwrap();
    let object = ObjectKey::new("archive.bin").unwrap();

    let session = client
        .start_upload(&bucket, &object, Some(&key))
        .await
        .unwrap();
    let uploader = client.uploader();

    uploader
        .upload_part(&session, 1, Bytes::from_static(b"part one"), Some(&key))
        .await
        .unwrap();
    let err = uploader
        .upload_part(&session, 2, Bytes::from_static(b"part two"), Some(&other))
        .await
        .unwrap_err();
    assert!(matches!(err.root(), UploadError::KeyMismatch(_)));
    assert_eq!(err.cleanup(), Some(&Cleanup::Aborted));

    assert!(matches!(
        uploader
            .upload_part(&session, 3, Bytes::from_static(b"part three"), None)
            .await,
        Err(UploadError::SessionClosed { .. })
    ));
    assert!(matches!(
        session.complete(3).await,
        Err(UploadError::SessionClosed { .. })
    ));

    let fingerprint = key.fingerprint().as_str().to_string();
    assert_eq!(*backend.sent_md5.lock(), vec![Some(fingerprint)]);
    assert_eq!(*backend.completes.lock(), 0);
    assert_eq!(*backend.aborts.lock(), 1);
}

#[tokio::test]
async fn keyless_part_on_encrypted_upload_aborts() {
    let backend = Arc::new(Lenient::default());
    let client = Client::new(backend.clone());
    let key = KeyProvider::new().generate().unwrap();

    let session = client
        .start_upload(
            &BucketId::new("uploads").unwrap(),
            &ObjectKey::new("archive.bin").unwrap(),
            Some(&key),
        )
        .await
        .unwrap();

    let err = client
        .uploader()
        .upload_part(&session, 1, Bytes::from_static(b"plaintext"), None)
        .await
        .unwrap_err();

    assert!(matches!(err.root(), UploadError::KeyMismatch(_)));
    assert!(backend.sent_md5.lock().is_empty());
    assert_eq!(*backend.aborts.lock(), 1);
    assert_eq!(session.state(), SessionState::Aborted);
}
