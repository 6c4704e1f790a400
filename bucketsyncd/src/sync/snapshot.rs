use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, watch};

use super::paths::is_same_or_descendant;
use super::scanner::{FileSystemNode, ScanError, file_paths, scan_root};

/// One complete, immutable view of the local tree.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TreeSnapshot {
    pub version: u64,
    pub nodes: Vec<FileSystemNode>,
}

impl TreeSnapshot {
    pub fn find(&self, tree_path: &str) -> Option<&FileSystemNode> {
        find_in(&self.nodes, tree_path)
    }

    /// Tree paths of every file at or below `tree_path`.
    pub fn files_under(&self, tree_path: &str) -> Vec<String> {
        if tree_path.trim_end_matches('/').is_empty() {
            return file_paths(&self.nodes);
        }
        match self.find(tree_path) {
            Some(node) if node.is_folder() => {
                file_paths(node.children.as_deref().unwrap_or_default())
            }
            Some(node) => vec![node.path.clone()],
            None => Vec::new(),
        }
    }
}

fn find_in<'a>(nodes: &'a [FileSystemNode], tree_path: &str) -> Option<&'a FileSystemNode> {
    for node in nodes {
        if node.path == tree_path {
            return Some(node);
        }
        if node.is_folder()
            && is_same_or_descendant(tree_path, &node.path)
            && let Some(children) = &node.children
        {
            return find_in(children, tree_path);
        }
    }
    None
}

/// Owns the published snapshot. Readers hold an `Arc` to whichever version was
/// current when they looked; refreshes replace the whole value.
pub struct SnapshotPublisher {
    root: PathBuf,
    tx: watch::Sender<Arc<TreeSnapshot>>,
    refresh_gate: Mutex<()>,
}

impl SnapshotPublisher {
    pub fn new(root: &Path) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(TreeSnapshot::default()));
        Self {
            root: root.to_path_buf(),
            tx,
            refresh_gate: Mutex::new(()),
        }
    }

    pub fn current(&self) -> Arc<TreeSnapshot> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<TreeSnapshot>> {
        self.tx.subscribe()
    }

    /// Rescans the root and publishes the result as the next version.
    pub async fn refresh(&self) -> Result<Arc<TreeSnapshot>, ScanError> {
        let _guard = self.refresh_gate.lock().await;
        let nodes = scan_root(&self.root).await?;
        let snapshot = Arc::new(TreeSnapshot {
            version: self.current().version + 1,
            nodes,
        });
        self.tx.send_replace(Arc::clone(&snapshot));
        Ok(snapshot)
    }
}
