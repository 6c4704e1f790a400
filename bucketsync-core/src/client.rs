use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::mtime::{format_original_mtime, from_system_time};
use crate::policy::{SyncDecision, push_decision};
use crate::store::{
    DownloadOptions, ObjectStore, ObjectSummary, RemoteObjectMetadata, StoreError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Uploaded,
    /// Another writer holds the file; the next event retries.
    SkippedLocked,
    /// Remote origin mtime is the same age or newer.
    SkippedUpToDate,
}

/// Front door to the bucket: CRUD, listing, and the conflict metadata encoding.
#[derive(Clone)]
pub struct ObjectStoreClient {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreClient {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Makes sure the bucket exists. Never fails: a broken store leaves the
    /// client in degraded mode and later calls simply fail and get logged.
    pub async fn init(&self) -> bool {
        match self.store.ensure_bucket().await {
            Ok(true) => {
                info!("bucket created");
                true
            }
            Ok(false) => {
                debug!("bucket already exists");
                true
            }
            Err(err) => {
                warn!(error = %err, "object store unavailable, running in degraded mode");
                false
            }
        }
    }

    pub async fn put(&self, local_path: &Path, key: &str) -> Result<PutOutcome, StoreError> {
        if !probe_unlocked(local_path).await? {
            debug!(key, path = %local_path.display(), "file is locked by another writer, skipping");
            return Ok(PutOutcome::SkippedLocked);
        }

        let modified = tokio::fs::metadata(local_path).await?.modified()?;
        let local_mtime = from_system_time(modified);
        let remote = self.store.head(key).await?;
        if push_decision(local_mtime, remote.as_ref()) == SyncDecision::NoOp {
            debug!(key, "remote is same age or newer, skipping upload");
            return Ok(PutOutcome::SkippedUpToDate);
        }

        self.store
            .upload(key, local_path, &format_original_mtime(local_mtime))
            .await?;
        info!(key, "uploaded");
        Ok(PutOutcome::Uploaded)
    }

    pub async fn get(&self, key: &str, dest_path: &Path) -> Result<(), StoreError> {
        let metadata = self
            .head_metadata(key)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })?;
        self.fetch(&metadata, dest_path).await
    }

    /// Downloads an object already probed with [`Self::head_metadata`]. The file
    /// appears with the remote origin mtime as its modification time.
    pub async fn fetch(
        &self,
        metadata: &RemoteObjectMetadata,
        dest_path: &Path,
    ) -> Result<(), StoreError> {
        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = DownloadOptions {
            expected_md5: metadata.content_md5(),
            modified: metadata.original_mtime,
        };
        self.store
            .download(&metadata.key, dest_path, &options)
            .await?;
        info!(key = %metadata.key, "downloaded");
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match self.store.delete(key).await {
            Ok(()) => {
                info!(key, "deleted remote object");
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                debug!(key, "remote object already absent");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub async fn list_all(&self) -> Result<Vec<ObjectSummary>, StoreError> {
        self.store.list().await
    }

    /// `Ok(None)` when there is no remote object; transport failures stay errors.
    pub async fn head_metadata(
        &self,
        key: &str,
    ) -> Result<Option<RemoteObjectMetadata>, StoreError> {
        self.store.head(key).await
    }
}

/// Best-effort check that no other writer holds the file: open it read/write
/// and try a non-blocking shared advisory lock.
async fn probe_unlocked(path: &Path) -> Result<bool, StoreError> {
    let path: PathBuf = path.to_path_buf();
    let probe = tokio::task::spawn_blocking(move || -> io::Result<bool> {
        let file = match std::fs::OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(err),
            Err(_) => return Ok(false),
        };
        match FileExt::try_lock_shared(&file) {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    })
    .await
    .map_err(io::Error::other)?;
    Ok(probe?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use tempfile::tempdir;

    #[tokio::test]
    async fn locked_file_is_skipped_without_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("busy.txt");
        std::fs::write(&path, b"busy").unwrap();
        let holder = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        FileExt::lock_exclusive(&holder).unwrap();

        let store = Arc::new(MemoryStore::new());
        let client = ObjectStoreClient::new(store.clone());
        let outcome = client.put(&path, "busy.txt").await.unwrap();

        assert_eq!(outcome, PutOutcome::SkippedLocked);
        assert_eq!(store.counts().uploads, 0);
        FileExt::unlock(&holder).unwrap();
    }

    #[tokio::test]
    async fn vanished_file_is_a_local_io_error() {
        let dir = tempdir().unwrap();
        let client = ObjectStoreClient::new(Arc::new(MemoryStore::new()));
        let err = client
            .put(&dir.path().join("gone.txt"), "gone.txt")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
