//! Local tree snapshots.
//!
//! A scan walks the directory depth-first and produces nodes whose ids are derived
//! from the relative path alone, so two scans of the same tree agree on every id.

use std::cmp::Ordering;
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("sync root is unavailable: {0}")]
    RootUnavailable(#[source] io::Error),
    #[error("scan task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    File,
    Folder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemNode {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Rooted at "/", forward slashes.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub modified_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FileSystemNode>>,
    pub is_leaf: bool,
}

impl FileSystemNode {
    pub fn is_folder(&self) -> bool {
        self.node_type == NodeType::Folder
    }
}

pub fn node_id(relative_path: &str) -> String {
    URL_SAFE_NO_PAD.encode(relative_path.trim_start_matches('/'))
}

/// Scans `dir`, whose position in the tree is `relative_path` ("" for the root).
/// An unreadable subtree is logged and contributes no entries.
pub fn scan(dir: &Path, relative_path: &str) -> Vec<FileSystemNode> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(path = %dir.display(), error = %err, "failed to read directory, skipping subtree");
            return Vec::new();
        }
    };

    let mut nodes = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(path = %dir.display(), error = %err, "failed to read directory entry");
                continue;
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let relative = if relative_path.is_empty() {
            name.clone()
        } else {
            format!("{relative_path}/{name}")
        };
        let path = entry.path();
        // Symlinks are neither listed nor followed; a link to an ancestor
        // would otherwise recurse forever.
        let metadata = match entry.metadata() {
            Ok(metadata) if metadata.file_type().is_symlink() => {
                debug!(path = %path.display(), "skipping symlink");
                continue;
            }
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to stat entry");
                continue;
            }
        };
        nodes.push(build_node(&path, name, &relative, &metadata));
    }
    nodes.sort_by(sibling_order);
    nodes
}

fn build_node(path: &Path, name: String, relative: &str, metadata: &Metadata) -> FileSystemNode {
    let is_dir = metadata.is_dir();
    FileSystemNode {
        id: node_id(relative),
        name,
        node_type: if is_dir {
            NodeType::Folder
        } else {
            NodeType::File
        },
        path: format!("/{relative}"),
        size: (!is_dir).then(|| metadata.len()),
        created_at: metadata.created().ok().map(OffsetDateTime::from),
        modified_at: metadata.modified().ok().map(OffsetDateTime::from),
        children: is_dir.then(|| scan(path, relative)),
        is_leaf: !is_dir,
    }
}

fn sibling_order(a: &FileSystemNode, b: &FileSystemNode) -> Ordering {
    b.is_folder()
        .cmp(&a.is_folder())
        .then_with(|| a.name.cmp(&b.name))
}

/// Scans the whole tree off the async runtime.
pub async fn scan_root(root: &Path) -> Result<Vec<FileSystemNode>, ScanError> {
    let root: PathBuf = root.to_path_buf();
    let nodes = tokio::task::spawn_blocking(move || -> Result<_, ScanError> {
        let metadata = std::fs::metadata(&root).map_err(ScanError::RootUnavailable)?;
        if !metadata.is_dir() {
            return Err(ScanError::RootUnavailable(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("{} is not a directory", root.display()),
            )));
        }
        Ok(scan(&root, ""))
    })
    .await??;
    Ok(nodes)
}

/// Tree paths of every file in `nodes`, depth-first.
pub fn file_paths(nodes: &[FileSystemNode]) -> Vec<String> {
    let mut out = Vec::new();
    collect_files(nodes, &mut out);
    out
}

fn collect_files(nodes: &[FileSystemNode], out: &mut Vec<String>) {
    for node in nodes {
        match &node.children {
            Some(children) => collect_files(children, out),
            None if !node.is_folder() => out.push(node.path.clone()),
            None => {}
        }
    }
}
