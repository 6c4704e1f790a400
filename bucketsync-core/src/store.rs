use std::io;
use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

use crate::transfer::TransferError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object store request failed: {0}")]
    Transport(String),
    #[error("object not found: {key}")]
    NotFound { key: String },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("invalid object key: {0}")]
    InvalidKey(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Remote unreachable, auth failure or server error.
    Transport,
    /// Missing remote object or local file.
    NotFound,
    /// Permission denied, disk full, file locked.
    LocalIo,
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::NotFound { .. } => ErrorClass::NotFound,
            StoreError::Io(err) if err.kind() == io::ErrorKind::NotFound => ErrorClass::NotFound,
            StoreError::Io(_) | StoreError::InvalidKey(_) => ErrorClass::LocalIo,
            StoreError::Transfer(TransferError::Io(_)) => ErrorClass::LocalIo,
            StoreError::Transfer(_) | StoreError::Transport(_) => ErrorClass::Transport,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }
}

/// What the store knows about one object, as returned by a metadata probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObjectMetadata {
    pub key: String,
    pub store_last_modified: Option<OffsetDateTime>,
    pub etag: Option<String>,
    pub size: Option<u64>,
    /// Origin modification time from custom metadata; the only value compared for freshness.
    pub original_mtime: Option<OffsetDateTime>,
}

impl RemoteObjectMetadata {
    /// The ETag as an MD5 digest, when the object was written in a single part.
    pub fn content_md5(&self) -> Option<String> {
        let etag = self.etag.as_deref()?.trim_matches('"');
        if etag.len() == 32 && etag.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(etag.to_ascii_lowercase())
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: Option<u64>,
    pub store_last_modified: Option<OffsetDateTime>,
}

/// Body download parameters.
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    pub expected_md5: Option<String>,
    /// Stamped onto the file before it appears under its final name.
    pub modified: Option<OffsetDateTime>,
}

/// A bucket-like backend. Keys are relative paths without a leading slash.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Returns `true` when the bucket had to be created.
    async fn ensure_bucket(&self) -> Result<bool, StoreError>;

    /// `Ok(None)` means the object does not exist.
    async fn head(&self, key: &str) -> Result<Option<RemoteObjectMetadata>, StoreError>;

    async fn upload(&self, key: &str, source: &Path, original_mtime: &str)
    -> Result<(), StoreError>;

    async fn download(
        &self,
        key: &str,
        target: &Path,
        options: &DownloadOptions,
    ) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn list(&self) -> Result<Vec<ObjectSummary>, StoreError>;
}

pub fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_md5_accepts_single_part_etags_only() {
        let mut meta = RemoteObjectMetadata {
            key: "a.txt".into(),
            store_last_modified: None,
            etag: Some("\"5D41402ABC4B2A76B9719D911017C592\"".into()),
            size: Some(5),
            original_mtime: None,
        };
        assert_eq!(
            meta.content_md5().as_deref(),
            Some("5d41402abc4b2a76b9719d911017c592")
        );

        meta.etag = Some("\"9b2cf535f27731c974343645a3985328-2\"".into());
        assert!(meta.content_md5().is_none());
    }

    #[test]
    fn classifies_errors_by_taxonomy() {
        let missing = StoreError::NotFound { key: "a".into() };
        assert!(missing.is_not_found());

        let gone = StoreError::Io(io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(gone.class(), ErrorClass::NotFound);

        let denied = StoreError::Io(io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(denied.class(), ErrorClass::LocalIo);

        let offline = StoreError::Transport("connection refused".into());
        assert_eq!(offline.class(), ErrorClass::Transport);
    }

    #[test]
    fn rejects_unsafe_keys() {
        assert!(validate_key("docs/readme.txt").is_ok());
        assert!(validate_key("/docs/readme.txt").is_err());
        assert!(validate_key("docs/../etc/passwd").is_err());
        assert!(validate_key("docs//a").is_err());
        assert!(validate_key("").is_err());
    }
}
