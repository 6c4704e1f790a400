use std::io;
use std::path::{Path, PathBuf};

use bucketsync_core::{
    ObjectStoreClient, PutOutcome, SyncDecision, from_system_time, pull_decision,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::engine::EngineError;
use super::paths::{is_hidden, key_from_tree_path, local_path_for};

/// Tally of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub uploaded: usize,
    pub downloaded: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn merge(&mut self, other: SyncReport) {
        self.uploaded += other.uploaded;
        self.downloaded += other.downloaded;
        self.deleted += other.deleted;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }

    fn record_push(&mut self, outcome: PutOutcome) {
        match outcome {
            PutOutcome::Uploaded => self.uploaded += 1,
            PutOutcome::SkippedLocked | PutOutcome::SkippedUpToDate => self.skipped += 1,
        }
    }
}

/// Applies last-writer-wins between the local root and the bucket.
#[derive(Clone)]
pub struct SyncReconciler {
    client: ObjectStoreClient,
    root: PathBuf,
}

impl SyncReconciler {
    pub fn new(client: ObjectStoreClient, root: &Path) -> Self {
        Self {
            client,
            root: root.to_path_buf(),
        }
    }

    pub fn client(&self) -> &ObjectStoreClient {
        &self.client
    }

    pub async fn push_file(&self, tree_path: &str) -> Result<PutOutcome, EngineError> {
        let key = key_from_tree_path(tree_path)?;
        let local = local_path_for(&self.root, &key)?;
        Ok(self.client.put(&local, &key).await?)
    }

    /// Pushes each path, logging failures instead of stopping.
    pub async fn push_paths(&self, tree_paths: &[String]) -> SyncReport {
        let mut report = SyncReport::default();
        for tree_path in tree_paths {
            match self.push_file(tree_path).await {
                Ok(outcome) => report.record_push(outcome),
                Err(err) => {
                    warn!(path = %tree_path, error = %err, "push failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Deletes the remote key of each path; already-absent keys count as deleted.
    pub async fn remove_remote(&self, tree_paths: &[String]) -> SyncReport {
        let mut report = SyncReport::default();
        for tree_path in tree_paths {
            let result = match key_from_tree_path(tree_path) {
                Ok(key) => self.client.delete(&key).await.map_err(EngineError::from),
                Err(err) => Err(err.into()),
            };
            match result {
                Ok(()) => report.deleted += 1,
                Err(err) => {
                    warn!(path = %tree_path, error = %err, "remote delete failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Downloads every remote object that is missing locally or carries a
    /// strictly newer origin mtime. Only a failed listing aborts the pass.
    pub async fn pull_all(&self) -> Result<SyncReport, EngineError> {
        let listing = self.client.list_all().await?;
        let mut report = SyncReport::default();
        for object in listing {
            if !is_syncable_key(&object.key) {
                debug!(key = %object.key, "skipping key outside the synced tree");
                report.skipped += 1;
                continue;
            }
            match self.pull_one(&object.key).await {
                Ok(true) => report.downloaded += 1,
                Ok(false) => report.skipped += 1,
                Err(err) => {
                    warn!(key = %object.key, error = %err, "pull failed");
                    report.failed += 1;
                }
            }
        }
        if !report.is_empty() {
            info!(
                downloaded = report.downloaded,
                skipped = report.skipped,
                failed = report.failed,
                "pull pass finished"
            );
        }
        Ok(report)
    }

    async fn pull_one(&self, key: &str) -> Result<bool, EngineError> {
        let local = local_path_for(&self.root, key)?;
        let local_mtime = match tokio::fs::metadata(&local).await {
            Ok(metadata) if metadata.is_dir() => {
                debug!(key, "local folder occupies the key's path, skipping");
                return Ok(false);
            }
            Ok(metadata) => Some(from_system_time(metadata.modified()?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };

        let Some(remote) = self.client.head_metadata(key).await? else {
            debug!(key, "object vanished after listing");
            return Ok(false);
        };
        if pull_decision(local_mtime, &remote) != SyncDecision::DownloadRemote {
            return Ok(false);
        }
        self.client.fetch(&remote, &local).await?;
        Ok(true)
    }
}

/// Folder markers, hidden paths and keys escaping the root never land locally.
fn is_syncable_key(key: &str) -> bool {
    !key.is_empty()
        && !key.ends_with('/')
        && !is_hidden(key)
        && !key.split('/').any(|segment| segment == "..")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketsync_core::MemoryStore;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    fn reconciler(root: &Path) -> (Arc<MemoryStore>, SyncReconciler) {
        let store = Arc::new(MemoryStore::new());
        let client = ObjectStoreClient::new(store.clone());
        (store, SyncReconciler::new(client, root))
    }

    fn set_mtime(path: &Path, at: SystemTime) {
        std::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(at)
            .unwrap();
    }

    #[test]
    fn filters_unsyncable_keys() {
        assert!(is_syncable_key("docs/readme.txt"));
        assert!(!is_syncable_key("docs/"));
        assert!(!is_syncable_key(".trash/a.txt"));
        assert!(!is_syncable_key("a/../../b"));
    }

    #[tokio::test]
    async fn pull_downloads_missing_and_newer_only() {
        let dir = tempdir().unwrap();
        let (store, reconciler) = reconciler(dir.path());
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);

        std::fs::write(dir.path().join("older.txt"), b"local").unwrap();
        set_mtime(&dir.path().join("older.txt"), t0);
        std::fs::write(dir.path().join("newer.txt"), b"local").unwrap();
        set_mtime(&dir.path().join("newer.txt"), t0 + Duration::from_secs(10));

        store.insert_object("fresh/new.txt", "new", Some(from_system_time(t0)));
        store.insert_object(
            "older.txt",
            "remote wins",
            Some(from_system_time(t0 + Duration::from_secs(5))),
        );
        store.insert_object("newer.txt", "remote loses", Some(from_system_time(t0)));

        let report = reconciler.pull_all().await.unwrap();
        assert_eq!(report.downloaded, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(
            std::fs::read(dir.path().join("fresh/new.txt")).unwrap(),
            b"new"
        );
        assert_eq!(
            std::fs::read(dir.path().join("older.txt")).unwrap(),
            b"remote wins"
        );
        assert_eq!(std::fs::read(dir.path().join("newer.txt")).unwrap(), b"local");
    }

    #[tokio::test]
    async fn pull_never_overwrites_without_origin_metadata() {
        let dir = tempdir().unwrap();
        let (store, reconciler) = reconciler(dir.path());
        std::fs::write(dir.path().join("a.txt"), b"mine").unwrap();
        store.insert_object("a.txt", "foreign", None);
        store.insert_object("b.txt", "foreign", None);

        let report = reconciler.pull_all().await.unwrap();
        assert_eq!(report.downloaded, 1);
        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"mine");
        assert_eq!(std::fs::read(dir.path().join("b.txt")).unwrap(), b"foreign");
    }

    #[tokio::test]
    async fn pull_fails_whole_pass_only_on_listing() {
        let dir = tempdir().unwrap();
        let (store, reconciler) = reconciler(dir.path());
        store.set_offline(true);
        assert!(reconciler.pull_all().await.is_err());
    }

    #[tokio::test]
    async fn push_paths_counts_each_outcome() {
        let dir = tempdir().unwrap();
        let (store, reconciler) = reconciler(dir.path());
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();

        let report = reconciler
            .push_paths(&["/a.txt".to_string(), "/gone.txt".to_string()])
            .await;
        assert_eq!(report.uploaded, 1);
        assert_eq!(report.failed, 1);

        let again = reconciler.push_paths(&["/a.txt".to_string()]).await;
        assert_eq!(again.skipped, 1);
        assert_eq!(store.counts().uploads, 1);
    }

    #[tokio::test]
    async fn remove_remote_treats_absent_keys_as_deleted() {
        let dir = tempdir().unwrap();
        let (store, reconciler) = reconciler(dir.path());
        store.insert_object("a.txt", "a", None);

        let report = reconciler
            .remove_remote(&["/a.txt".to_string(), "/never.txt".to_string()])
            .await;
        assert_eq!(report.deleted, 2);
        assert!(store.keys().is_empty());
    }
}
