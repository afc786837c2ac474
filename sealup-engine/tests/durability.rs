//! Integration tests for state that must survive reopening the store

use bytes::Bytes;
use sealup_core::*;
use sealup_engine::*;

fn part_request(
    bucket: &BucketId,
    key: &ObjectKey,
    upload_id: &UploadId,
    n: u32,
    body: &'static [u8],
    sse: &EncryptionKey,
) -> UploadPartRequest {
    UploadPartRequest {
        bucket: bucket.clone(),
        key: key.clone(),
        upload_id: upload_id.clone(),
        part_number: PartNumber::new(n).unwrap(),
        body: Bytes::from_static(body),
        checksum_sha256: None,
        sse: Some(sse.headers()),
    }
}

#[tokio::test]
async fn in_progress_upload_survives_reopen() {
    let temp = tempfile::tempdir().unwrap();
    let bucket = BucketId::new("durable").unwrap();
    let key = ObjectKey::new("backups/db.tar").unwrap();
    let sse = KeyProvider::new().generate().unwrap();

    let (upload_id, first) = {
        let store = LocalStore::open(temp.path()).unwrap().with_min_part_size(1);
        store.create_bucket(&bucket).unwrap();

        let init = store
            .initiate(&InitiateRequest {
                bucket: bucket.clone(),
                key: key.clone(),
                sse: Some(sse.headers()),
            })
            .await
            .unwrap();
        let first = store
            .upload_part(&part_request(&bucket, &key, &init.upload_id, 1, b"first ", &sse))
            .await
            .unwrap();
        (init.upload_id, first)
    };

    let store = LocalStore::open(temp.path()).unwrap().with_min_part_size(1);

    let uploads = store.list_uploads(&bucket).unwrap();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].upload_id, upload_id);
    assert!(uploads[0].encrypted);

    let second = store
        .upload_part(&part_request(&bucket, &key, &upload_id, 2, b"second", &sse))
        .await
        .unwrap();

    store
        .complete(&CompleteRequest {
            bucket: bucket.clone(),
            key: key.clone(),
            upload_id: upload_id.clone(),
            parts: vec![
                CompletedPart {
                    part_number: PartNumber::new(1).unwrap(),
                    etag: first.etag,
                },
                CompletedPart {
                    part_number: PartNumber::new(2).unwrap(),
                    etag: second.etag,
                },
            ],
            sse: Some(sse.headers()),
        })
        .await
        .unwrap();

    let data = store.get_object(&bucket, &key, Some(&sse.headers())).unwrap();
    assert_eq!(data, b"first second");
}

#[tokio::test]
async fn completed_object_survives_reopen() {
    let temp = tempfile::tempdir().unwrap();
    let bucket = BucketId::new("durable").unwrap();
    let key = ObjectKey::new("object").unwrap();
    let sse = KeyProvider::new().generate().unwrap();

    let version = {
        let store = LocalStore::open(temp.path()).unwrap();
        store.create_bucket(&bucket).unwrap();

        let init = store
            .initiate(&InitiateRequest {
                bucket: bucket.clone(),
                key: key.clone(),
                sse: Some(sse.headers()),
            })
            .await
            .unwrap();
        let part = store
            .upload_part(&part_request(&bucket, &key, &init.upload_id, 1, b"payload", &sse))
            .await
            .unwrap();
        store
            .complete(&CompleteRequest {
                bucket: bucket.clone(),
                key: key.clone(),
                upload_id: init.upload_id,
                parts: vec![CompletedPart {
                    part_number: PartNumber::new(1).unwrap(),
                    etag: part.etag,
                }],
                sse: Some(sse.headers()),
            })
            .await
            .unwrap()
            .version
    };

    let store = LocalStore::open(temp.path()).unwrap();
    let info = store.object_info(&bucket, &key).unwrap();
    assert_eq!(info.version, version);
    assert_eq!(info.sse_key_md5.as_deref(), Some(sse.fingerprint().as_str()));
    assert_eq!(
        store.get_object(&bucket, &key, Some(&sse.headers())).unwrap(),
        b"payload"
    );
}
