//! Bucket abstraction over fjall partitions
//!
//! Layout inside `<bucket>_main`:
//! - `upload:<upload id>` -> [`UploadRecord`]
//! - `part:<upload id>:<part number>` -> [`PartRecord`]
//! - `data:<upload id>:<part number>` -> part body (ciphertext for SSE-C)
//! - `object:<object key>` -> [`ObjectRecord`]

use fjall::{Batch, PartitionCreateOptions, PartitionHandle};
use sealup_core::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;

use crate::{storage_error, Result, StorageEngine};

/// In-progress multipart upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    pub upload_id: UploadId,
    pub key: ObjectKey,
    /// Fingerprint bound to the upload at initiate time
    pub sse_key_md5: Option<String>,
    pub initiated_at: SystemTime,
}

/// Stored part metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartRecord {
    pub part_number: PartNumber,
    pub etag: ETag,
    /// Plaintext length
    pub size: u64,
    /// AES-GCM nonce, present for encrypted parts
    pub nonce: Option<[u8; 12]>,
}

/// Finished object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub upload_id: UploadId,
    pub version: ObjectVersion,
    pub etag: ETag,
    pub size: u64,
    pub sse_key_md5: Option<String>,
    pub parts: Vec<PartRecord>,
}

/// Bucket represents a namespace of uploads and objects
pub struct Bucket {
    id: BucketId,
    pub(crate) main_partition: Arc<PartitionHandle>,
    engine: StorageEngine,
}

impl Bucket {
    /// Open bucket partition
    pub(crate) fn new(engine: StorageEngine, id: BucketId) -> Result<Self> {
        let partition_name = format!("{}_main", id.as_str());

        let main_partition = Arc::new(
            engine
                .keyspace()
                .open_partition(&partition_name, PartitionCreateOptions::default())
                .map_err(storage_error)?,
        );

        Ok(Bucket {
            id,
            main_partition,
            engine,
        })
    }

    /// Get bucket ID
    pub fn id(&self) -> &BucketId {
        &self.id
    }

    pub fn put_upload(&self, record: &UploadRecord) -> Result<()> {
        self.put_json(&upload_key(&record.upload_id), record)?;
        self.engine.persist()
    }

    pub fn get_upload(&self, upload_id: &UploadId) -> Result<Option<UploadRecord>> {
        self.get_json(&upload_key(upload_id))
    }

    /// All in-progress uploads, oldest upload id first
    pub fn uploads(&self) -> Result<Vec<UploadRecord>> {
        self.scan_json(b"upload:")
    }

    /// Store part metadata and body, replacing an earlier upload of the same part
    pub fn put_part(&self, upload_id: &UploadId, record: &PartRecord, body: &[u8]) -> Result<()> {
        let mut batch = self.batch();
        let meta = serde_json::to_vec(record).map_err(storage_error)?;
        batch.insert(&self.main_partition, part_key(upload_id, record.part_number), meta);
        batch.insert(&self.main_partition, data_key(upload_id, record.part_number), body);
        batch.commit().map_err(storage_error)?;
        self.engine.persist()
    }

    pub fn get_part(
        &self,
        upload_id: &UploadId,
        part_number: PartNumber,
    ) -> Result<Option<PartRecord>> {
        self.get_json(&part_key(upload_id, part_number))
    }

    /// Parts of an upload in ascending part-number order
    pub fn parts(&self, upload_id: &UploadId) -> Result<Vec<PartRecord>> {
        self.scan_json(format!("part:{}:", upload_id).as_bytes())
    }

    pub fn get_part_data(
        &self,
        upload_id: &UploadId,
        part_number: PartNumber,
    ) -> Result<Option<Vec<u8>>> {
        match self.main_partition.get(data_key(upload_id, part_number)) {
            Ok(Some(data)) => Ok(Some(data.to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_error(e)),
        }
    }

    pub fn get_object(&self, key: &ObjectKey) -> Result<Option<ObjectRecord>> {
        self.get_json(&object_key(key))
    }

    /// Publish an object built from `upload`'s parts in one atomic batch
    ///
    /// Drops the upload record, every part record, bodies of parts not named
    /// in `object`, and the bodies of any object previously stored at `key`.
    pub fn commit_object(&self, key: &ObjectKey, object: &ObjectRecord) -> Result<()> {
        let previous = self.get_object(key)?;
        let uploaded = self.parts(&object.upload_id)?;

        let mut batch = self.batch();
        let json = serde_json::to_vec(object).map_err(storage_error)?;
        batch.insert(&self.main_partition, object_key(key), json);
        batch.remove(&self.main_partition, upload_key(&object.upload_id));

        for part in &uploaded {
            batch.remove(&self.main_partition, part_key(&object.upload_id, part.part_number));
            if !object.parts.iter().any(|p| p.part_number == part.part_number) {
                batch.remove(&self.main_partition, data_key(&object.upload_id, part.part_number));
            }
        }

        if let Some(previous) = previous {
            for part in &previous.parts {
                batch.remove(&self.main_partition, data_key(&previous.upload_id, part.part_number));
            }
        }

        batch.commit().map_err(storage_error)?;
        self.engine.persist()
    }

    /// Remove an upload with all of its parts
    pub fn discard_upload(&self, upload_id: &UploadId) -> Result<usize> {
        let parts = self.parts(upload_id)?;

        let mut batch = self.batch();
        batch.remove(&self.main_partition, upload_key(upload_id));
        for part in &parts {
            batch.remove(&self.main_partition, part_key(upload_id, part.part_number));
            batch.remove(&self.main_partition, data_key(upload_id, part.part_number));
        }
        batch.commit().map_err(storage_error)?;
        self.engine.persist()?;

        Ok(parts.len())
    }

    fn batch(&self) -> Batch {
        self.engine.keyspace().batch()
    }

    fn put_json<T: Serialize>(&self, key: &[u8], value: &T) -> Result<()> {
        let json = serde_json::to_vec(value).map_err(storage_error)?;
        self.main_partition.insert(key, json).map_err(storage_error)
    }

    fn get_json<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.main_partition.get(key) {
            Ok(Some(data)) => serde_json::from_slice(&data).map(Some).map_err(storage_error),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_error(e)),
        }
    }

    fn scan_json<T: DeserializeOwned>(&self, prefix: &[u8]) -> Result<Vec<T>> {
        let mut values = Vec::new();

        for item in self.main_partition.range(prefix.to_vec()..) {
            let (key, value) = item.map_err(storage_error)?;
            if !key.starts_with(prefix) {
                break;
            }
            values.push(serde_json::from_slice(&value).map_err(storage_error)?);
        }

        Ok(values)
    }
}

// Part numbers are zero-padded so lexicographic order is numeric order

fn upload_key(upload_id: &UploadId) -> Vec<u8> {
    format!("upload:{}", upload_id).into_bytes()
}

fn part_key(upload_id: &UploadId, part_number: PartNumber) -> Vec<u8> {
    format!("part:{}:{:05}", upload_id, part_number.get()).into_bytes()
}

fn data_key(upload_id: &UploadId, part_number: PartNumber) -> Vec<u8> {
    format!("data:{}:{:05}", upload_id, part_number.get()).into_bytes()
}

fn object_key(key: &ObjectKey) -> Vec<u8> {
    format!("object:{}", key).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_bucket() -> (Bucket, tempfile::TempDir) {
        let (engine, temp) = StorageEngine::temp().unwrap();
        let bucket_id = BucketId::new("test-bucket").unwrap();
        engine.create_bucket(&bucket_id).unwrap();
        (engine.bucket(&bucket_id).unwrap(), temp)
    }

    fn upload(id: &str) -> UploadRecord {
        UploadRecord {
            upload_id: UploadId::new(id),
            key: ObjectKey::new("object").unwrap(),
            sse_key_md5: None,
            initiated_at: SystemTime::now(),
        }
    }

    fn part(n: u32, body: &[u8]) -> PartRecord {
        PartRecord {
            part_number: PartNumber::new(n).unwrap(),
            etag: ETag::new(ContentHash::new(body).to_hex()),
            size: body.len() as u64,
            nonce: None,
        }
    }

    #[test]
    fn test_parts_are_numerically_ordered() {
        let (bucket, _temp) = open_bucket();
        let record = upload("u1");
        bucket.put_upload(&record).unwrap();

        for n in [10, 2, 1] {
            bucket.put_part(&record.upload_id, &part(n, &[n as u8]), &[n as u8]).unwrap();
        }

        let numbers: Vec<u32> = bucket
            .parts(&record.upload_id)
            .unwrap()
            .iter()
            .map(|p| p.part_number.get())
            .collect();
        assert_eq!(numbers, vec![1, 2, 10]);
    }

    #[test]
    fn test_parts_scan_does_not_leak_across_uploads() {
        let (bucket, _temp) = open_bucket();
        bucket.put_upload(&upload("u1")).unwrap();
        bucket.put_upload(&upload("u10")).unwrap();

        bucket.put_part(&UploadId::new("u1"), &part(1, b"a"), b"a").unwrap();
        bucket.put_part(&UploadId::new("u10"), &part(1, b"b"), b"b").unwrap();

        assert_eq!(bucket.parts(&UploadId::new("u1")).unwrap().len(), 1);
        assert_eq!(bucket.uploads().unwrap().len(), 2);
    }

    #[test]
    fn test_discard_upload() {
        let (bucket, _temp) = open_bucket();
        let record = upload("u1");
        bucket.put_upload(&record).unwrap();
        bucket.put_part(&record.upload_id, &part(1, b"a"), b"a").unwrap();
        bucket.put_part(&record.upload_id, &part(2, b"b"), b"b").unwrap();

        assert_eq!(bucket.discard_upload(&record.upload_id).unwrap(), 2);
        assert!(bucket.get_upload(&record.upload_id).unwrap().is_none());
        assert!(bucket.parts(&record.upload_id).unwrap().is_empty());
        assert!(bucket
            .get_part_data(&record.upload_id, PartNumber::new(1).unwrap())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_commit_object_replaces_previous() {
        let (bucket, _temp) = open_bucket();
        let key = ObjectKey::new("object").unwrap();

        for (id, body) in [("u1", b"first".as_slice()), ("u2", b"second".as_slice())] {
            let record = upload(id);
            bucket.put_upload(&record).unwrap();
            let part = part(1, body);
            bucket.put_part(&record.upload_id, &part, body).unwrap();

            let object = ObjectRecord {
                upload_id: record.upload_id.clone(),
                version: ObjectVersion::new(),
                etag: part.etag.clone(),
                size: part.size,
                sse_key_md5: None,
                parts: vec![part],
            };
            bucket.commit_object(&key, &object).unwrap();
        }

        let stored = bucket.get_object(&key).unwrap().unwrap();
        assert_eq!(stored.upload_id, UploadId::new("u2"));
        assert!(bucket.uploads().unwrap().is_empty());

        let one = PartNumber::new(1).unwrap();
        assert!(bucket.get_part_data(&UploadId::new("u1"), one).unwrap().is_none());
        assert_eq!(
            bucket.get_part_data(&UploadId::new("u2"), one).unwrap().unwrap(),
            b"second"
        );
    }
}
