use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bucketsync_core::{ObjectStoreClient, StoreError};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::local_watcher::LocalEvent;
use super::paths::{
    PathError, is_same_or_descendant, join_tree_path, key_from_tree_path, local_path_for,
    normalize_tree_path, tree_path_for, validate_name,
};
use super::reconciler::{SyncReconciler, SyncReport};
use super::scanner::{ScanError, file_paths, scan};
use super::snapshot::{SnapshotPublisher, TreeSnapshot};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("object store error: {0}")]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("scan error: {0}")]
    Scan(#[from] ScanError),
    #[error("no such item: {0}")]
    NotFound(String),
    #[error("cannot move {from} into {to}")]
    InvalidMove { from: String, to: String },
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Remote work started by a local change. Dropping it leaves the work running.
#[derive(Debug, Default)]
pub struct PendingSync {
    completed: SyncReport,
    tasks: Vec<JoinHandle<SyncReport>>,
}

impl PendingSync {
    fn completed(report: SyncReport) -> Self {
        Self {
            completed: report,
            tasks: Vec::new(),
        }
    }

    fn and(mut self, other: PendingSync) -> Self {
        self.completed.merge(other.completed);
        self.tasks.extend(other.tasks);
        self
    }

    /// Waits for every remote operation and sums their reports.
    pub async fn wait(self) -> Result<SyncReport, EngineError> {
        let mut report = self.completed;
        for task in self.tasks {
            report.merge(task.await?);
        }
        Ok(report)
    }
}

/// CRUD surface over the watched root. Every local change flows through
/// [`SyncEngine::publish_change`], whether it came from the watcher or from here.
pub struct SyncEngine {
    root: PathBuf,
    reconciler: SyncReconciler,
    snapshots: SnapshotPublisher,
}

impl SyncEngine {
    pub fn new(client: ObjectStoreClient, root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            reconciler: SyncReconciler::new(client, root),
            snapshots: SnapshotPublisher::new(root),
        }
    }

    pub fn client(&self) -> &ObjectStoreClient {
        self.reconciler.client()
    }

    pub fn get_tree(&self) -> Arc<TreeSnapshot> {
        self.snapshots.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<TreeSnapshot>> {
        self.snapshots.subscribe()
    }

    pub async fn refresh(&self) -> Result<Arc<TreeSnapshot>, EngineError> {
        Ok(self.snapshots.refresh().await?)
    }

    /// Single ingestion point for local changes: republishes the snapshot, then
    /// starts the matching remote work in the background.
    pub async fn publish_change(&self, event: LocalEvent) -> PendingSync {
        let event = match event.normalized() {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "ignoring local change with an unusable path");
                return PendingSync::default();
            }
        };
        debug!(?event, "local change");
        match event {
            LocalEvent::Add(path) | LocalEvent::Change(path) => {
                self.refresh_logged().await;
                let reconciler = self.reconciler.clone();
                self.spawn(async move { reconciler.push_paths(&[path]).await })
            }
            LocalEvent::Unlink(path) => self.publish_removal(path, false).await,
            LocalEvent::UnlinkDir(path) => self.publish_removal(path, true).await,
            LocalEvent::AddDir(path) => {
                let files = match self.snapshots.refresh().await {
                    Ok(snapshot) => snapshot.files_under(&path),
                    Err(err) => {
                        warn!(error = %err, "snapshot refresh failed");
                        Vec::new()
                    }
                };
                let reconciler = self.reconciler.clone();
                self.spawn(async move { reconciler.push_paths(&files).await })
            }
            LocalEvent::Ready => {
                let files = match self.snapshots.refresh().await {
                    Ok(snapshot) => snapshot.files_under("/"),
                    Err(err) => {
                        warn!(error = %err, "snapshot refresh failed");
                        Vec::new()
                    }
                };
                let reconciler = self.reconciler.clone();
                self.spawn(async move {
                    let mut report = reconciler.push_paths(&files).await;
                    match reconciler.pull_all().await {
                        Ok(pulled) => report.merge(pulled),
                        Err(err) => {
                            warn!(error = %err, "initial pull failed");
                            report.failed += 1;
                        }
                    }
                    if !report.is_empty() {
                        info!(
                            uploaded = report.uploaded,
                            downloaded = report.downloaded,
                            failed = report.failed,
                            "initial sync finished"
                        );
                    }
                    report
                })
            }
        }
    }

    /// Remote keys to drop are read from the snapshot taken before the removal,
    /// since the local side can no longer be enumerated.
    async fn publish_removal(&self, path: String, dir: bool) -> PendingSync {
        let prior = self.snapshots.current();
        let doomed = match prior.find(&path) {
            Some(node) if node.is_folder() => prior.files_under(&path),
            Some(_) => vec![path],
            None if !dir => vec![path],
            None => Vec::new(),
        };
        self.refresh_logged().await;
        let reconciler = self.reconciler.clone();
        self.spawn(async move { reconciler.remove_remote(&doomed).await })
    }

    pub async fn create_file(
        &self,
        parent: &str,
        name: &str,
        content: Option<&[u8]>,
    ) -> Result<(String, PendingSync), EngineError> {
        validate_name(name)?;
        let parent = normalize_tree_path(parent)?;
        let tree_path = join_tree_path(&parent, name);
        let local = self.existing_dir_child(&parent, name).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&local)
            .await?;
        file.write_all(content.unwrap_or_default()).await?;
        file.flush().await?;
        drop(file);
        let pending = self.publish_change(LocalEvent::Add(tree_path.clone())).await;
        Ok((tree_path, pending))
    }

    pub async fn create_folder(
        &self,
        parent: &str,
        name: &str,
    ) -> Result<(String, PendingSync), EngineError> {
        validate_name(name)?;
        let parent = normalize_tree_path(parent)?;
        let tree_path = join_tree_path(&parent, name);
        let local = self.existing_dir_child(&parent, name).await?;
        tokio::fs::create_dir(&local).await?;
        let pending = self
            .publish_change(LocalEvent::AddDir(tree_path.clone()))
            .await;
        Ok((tree_path, pending))
    }

    /// Files are removed locally and the unlink is published. Folders have every
    /// contained key deleted remotely first; only then is the subtree removed.
    pub async fn delete_item(&self, tree_path: &str) -> Result<PendingSync, EngineError> {
        let item = item_path(tree_path)?;
        let tree_path = item.as_str();
        let local = local_path_for(&self.root, tree_path)?;
        let metadata = match tokio::fs::symlink_metadata(&local).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(EngineError::NotFound(tree_path.to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        if !metadata.is_dir() {
            tokio::fs::remove_file(&local).await?;
            return Ok(self
                .publish_change(LocalEvent::Unlink(tree_path.to_string()))
                .await);
        }

        let files = self.enumerate_files(&local, tree_path).await?;
        let report = self.reconciler.remove_remote(&files).await;
        if report.failed > 0 {
            warn!(
                path = tree_path,
                failed = report.failed,
                "some remote keys survived folder deletion"
            );
        }
        tokio::fs::remove_dir_all(&local).await?;
        self.refresh_logged().await;
        Ok(PendingSync::completed(report))
    }

    /// Copies `source` into `target_dir`, replacing a same-named file.
    pub async fn import_file(
        &self,
        source: &Path,
        target_dir: &str,
    ) -> Result<(String, PendingSync), EngineError> {
        let name = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| PathError::InvalidName(source.display().to_string()))?;
        validate_name(&name)?;
        let target_dir = normalize_tree_path(target_dir)?;
        let local = self.existing_dir_child(&target_dir, &name).await?;
        tokio::fs::copy(source, &local).await?;
        let tree_path = join_tree_path(&target_dir, &name);
        let pending = self.publish_change(LocalEvent::Add(tree_path.clone())).await;
        Ok((tree_path, pending))
    }

    pub async fn import_file_from_buffer(
        &self,
        name: &str,
        bytes: &[u8],
        target_dir: &str,
    ) -> Result<(String, PendingSync), EngineError> {
        validate_name(name)?;
        let target_dir = normalize_tree_path(target_dir)?;
        let local = self.existing_dir_child(&target_dir, name).await?;
        tokio::fs::write(&local, bytes).await?;
        let tree_path = join_tree_path(&target_dir, name);
        let pending = self.publish_change(LocalEvent::Add(tree_path.clone())).await;
        Ok((tree_path, pending))
    }

    /// Renames locally. The bucket has no rename, so the old keys are deleted
    /// and the new ones uploaded.
    pub async fn move_item(
        &self,
        source: &str,
        target_dir: &str,
    ) -> Result<(String, PendingSync), EngineError> {
        let source = item_path(source)?;
        let target_dir = normalize_tree_path(target_dir)?;
        let from = local_path_for(&self.root, &source)?;
        let name = from
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| EngineError::NotFound(source.clone()))?;
        let target_path = join_tree_path(&target_dir, &name);
        if is_same_or_descendant(&target_dir, &source) || target_path == source {
            return Err(EngineError::InvalidMove {
                from: source,
                to: target_dir,
            });
        }

        let metadata = match tokio::fs::symlink_metadata(&from).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(EngineError::NotFound(source));
            }
            Err(err) => return Err(err.into()),
        };
        let to = self.existing_dir_child(&target_dir, &name).await?;
        tokio::fs::rename(&from, &to).await?;

        let (removed, added) = if metadata.is_dir() {
            (
                LocalEvent::UnlinkDir(source),
                LocalEvent::AddDir(target_path.clone()),
            )
        } else {
            (
                LocalEvent::Unlink(source),
                LocalEvent::Add(target_path.clone()),
            )
        };
        let pending = self
            .publish_change(removed)
            .await
            .and(self.publish_change(added).await);
        Ok((target_path, pending))
    }

    pub async fn read_file(&self, tree_path: &str) -> Result<String, EngineError> {
        let tree_path = item_path(tree_path)?;
        let local = local_path_for(&self.root, &tree_path)?;
        match tokio::fs::read(&local).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(EngineError::NotFound(tree_path))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Full pull pass against a fresh listing, then a snapshot refresh.
    pub async fn force_sync(&self) -> Result<SyncReport, EngineError> {
        let report = self.reconciler.pull_all().await?;
        self.refresh_logged().await;
        Ok(report)
    }

    async fn refresh_logged(&self) {
        if let Err(err) = self.snapshots.refresh().await {
            warn!(error = %err, "snapshot refresh failed");
        }
    }

    fn spawn<F>(&self, work: F) -> PendingSync
    where
        F: std::future::Future<Output = SyncReport> + Send + 'static,
    {
        PendingSync {
            completed: SyncReport::default(),
            tasks: vec![tokio::spawn(work)],
        }
    }

    /// Local path of `name` inside the existing folder `parent`.
    async fn existing_dir_child(&self, parent: &str, name: &str) -> Result<PathBuf, EngineError> {
        let dir = local_path_for(&self.root, parent)?;
        match tokio::fs::metadata(&dir).await {
            Ok(metadata) if metadata.is_dir() => Ok(dir.join(name)),
            Ok(_) => Err(EngineError::NotFound(parent.to_string())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(EngineError::NotFound(parent.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Tree paths of every file below a local folder, read from disk.
    async fn enumerate_files(&self, dir: &Path, tree_path: &str) -> Result<Vec<String>, EngineError> {
        let dir = dir.to_path_buf();
        let relative = key_from_tree_path(tree_path)?;
        let nodes = tokio::task::spawn_blocking(move || scan(&dir, &relative)).await?;
        Ok(file_paths(&nodes))
    }
}

/// Canonical tree path of an item below the root; the root itself is rejected.
fn item_path(path: &str) -> Result<String, EngineError> {
    Ok(tree_path_for(&key_from_tree_path(path)?))
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
