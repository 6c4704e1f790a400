//! In-process object store.
//!
//! Behaves like a bucket from the client's point of view: keys are flat, bodies are
//! opaque, custom metadata is a string map. Counts every body transfer and delete so
//! callers can reason about how much work a sync pass did.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::mtime::{ORIGINAL_MTIME_KEY, format_original_mtime, parse_original_mtime};
use crate::store::{
    DownloadOptions, ObjectStore, ObjectSummary, RemoteObjectMetadata, StoreError, validate_key,
};
use crate::transfer::install_bytes;

#[derive(Debug, Clone)]
struct StoredObject {
    body: Vec<u8>,
    metadata: HashMap<String, String>,
    last_modified: OffsetDateTime,
    etag: String,
}

impl StoredObject {
    fn new(body: Vec<u8>, metadata: HashMap<String, String>) -> Self {
        let etag = format!("\"{:x}\"", md5::compute(&body));
        Self {
            body,
            metadata,
            last_modified: OffsetDateTime::now_utc(),
            etag,
        }
    }

    fn describe(&self, key: &str) -> RemoteObjectMetadata {
        RemoteObjectMetadata {
            key: key.to_string(),
            store_last_modified: Some(self.last_modified),
            etag: Some(self.etag.clone()),
            size: Some(self.body.len() as u64),
            original_mtime: self
                .metadata
                .get(ORIGINAL_MTIME_KEY)
                .and_then(|value| parse_original_mtime(value)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferCounts {
    pub uploads: usize,
    pub downloads: usize,
    pub deletes: usize,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    bucket_exists: AtomicBool,
    offline: AtomicBool,
    uploads: AtomicUsize,
    downloads: AtomicUsize,
    deletes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Writes an object the way a foreign writer would, bypassing the counters.
    pub fn insert_object(
        &self,
        key: &str,
        body: impl Into<Vec<u8>>,
        original_mtime: Option<OffsetDateTime>,
    ) {
        let mut metadata = HashMap::new();
        if let Some(mtime) = original_mtime {
            metadata.insert(ORIGINAL_MTIME_KEY.to_string(), format_original_mtime(mtime));
        }
        self.lock()
            .insert(key.to_string(), StoredObject::new(body.into(), metadata));
    }

    pub fn object_body(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().get(key).map(|object| object.body.clone())
    }

    pub fn object_metadata(&self, key: &str) -> Option<RemoteObjectMetadata> {
        self.lock().get(key).map(|object| object.describe(key))
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn bucket_exists(&self) -> bool {
        self.bucket_exists.load(Ordering::SeqCst)
    }

    pub fn counts(&self) -> TransferCounts {
        TransferCounts {
            uploads: self.uploads.load(Ordering::SeqCst),
            downloads: self.downloads.load(Ordering::SeqCst),
            deletes: self.deletes.load(Ordering::SeqCst),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, StoredObject>> {
        // A poisoned map still holds consistent entries; every mutation is a single insert/remove.
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Transport("memory store is offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn ensure_bucket(&self) -> Result<bool, StoreError> {
        self.check_online()?;
        Ok(!self.bucket_exists.swap(true, Ordering::SeqCst))
    }

    async fn head(&self, key: &str) -> Result<Option<RemoteObjectMetadata>, StoreError> {
        self.check_online()?;
        Ok(self.object_metadata(key))
    }

    async fn upload(
        &self,
        key: &str,
        source: &Path,
        original_mtime: &str,
    ) -> Result<(), StoreError> {
        self.check_online()?;
        validate_key(key)?;
        let body = tokio::fs::read(source).await?;
        let metadata = HashMap::from([(ORIGINAL_MTIME_KEY.to_string(), original_mtime.to_string())]);
        self.lock()
            .insert(key.to_string(), StoredObject::new(body, metadata));
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn download(
        &self,
        key: &str,
        target: &Path,
        options: &DownloadOptions,
    ) -> Result<(), StoreError> {
        self.check_online()?;
        let body = self
            .object_body(key)
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })?;
        install_bytes(target, &body, options.modified).await?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check_online()?;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        match self.lock().remove(key) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn list(&self) -> Result<Vec<ObjectSummary>, StoreError> {
        self.check_online()?;
        Ok(self
            .lock()
            .iter()
            .map(|(key, object)| ObjectSummary {
                key: key.clone(),
                size: Some(object.body.len() as u64),
                store_last_modified: Some(object.last_modified),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use time::macros::datetime;

    #[tokio::test]
    async fn upload_then_download_round_trips_body_and_metadata() {
        let store = MemoryStore::new();
        let dir = tempdir().unwrap();
        let source = dir.path().join("in.txt");
        std::fs::write(&source, b"hello").unwrap();

        store
            .upload("docs/in.txt", &source, "2024-01-01T00:00:00.000Z")
            .await
            .unwrap();
        let meta = store.head("docs/in.txt").await.unwrap().unwrap();
        assert_eq!(meta.original_mtime, Some(datetime!(2024-01-01 00:00 UTC)));
        assert_eq!(
            meta.content_md5().as_deref(),
            Some("5d41402abc4b2a76b9719d911017c592")
        );

        let target = dir.path().join("out/in.txt");
        store
            .download("docs/in.txt", &target, &DownloadOptions::default())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"hello");
        assert_eq!(
            store.counts(),
            TransferCounts {
                uploads: 1,
                downloads: 1,
                deletes: 0
            }
        );
    }

    #[tokio::test]
    async fn ensure_bucket_reports_creation_once() {
        let store = MemoryStore::new();
        assert!(store.ensure_bucket().await.unwrap());
        assert!(!store.ensure_bucket().await.unwrap());
        assert!(store.bucket_exists());
    }

    #[tokio::test]
    async fn offline_store_fails_with_transport_error() {
        let store = MemoryStore::new();
        store.set_offline(true);
        let err = store.list().await.unwrap_err();
        assert!(matches!(err, StoreError::Transport(_)));
    }

    #[tokio::test]
    async fn deleting_missing_object_reports_not_found() {
        let store = MemoryStore::new();
        let err = store.delete("nope.txt").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.counts().deletes, 1);
    }
}
