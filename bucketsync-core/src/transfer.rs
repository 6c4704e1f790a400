use std::{
    env, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use futures_util::StreamExt;
use md5::Context;
use reqwest::Client;
use reqwest::header::CONTENT_LENGTH;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::io::ReaderStream;
use url::Url;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
    #[error("download integrity check failed: expected {expected_md5}, got {actual_md5}")]
    IntegrityMismatch {
        expected_md5: String,
        actual_md5: String,
    },
}

#[derive(Clone)]
pub struct TransferClient {
    http: Client,
    download_limit: Arc<Semaphore>,
    upload_limit: Arc<Semaphore>,
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub download_concurrency: usize,
    pub upload_concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_concurrency: read_limit("BUCKETSYNC_DOWNLOAD_CONCURRENCY", 4),
            upload_concurrency: read_limit("BUCKETSYNC_UPLOAD_CONCURRENCY", 2),
        }
    }
}

impl TransferClient {
    pub fn new() -> Self {
        Self::with_config(TransferConfig::default())
    }

    pub fn with_config(config: TransferConfig) -> Self {
        Self {
            http: Client::new(),
            download_limit: Arc::new(Semaphore::new(config.download_concurrency.max(1))),
            upload_limit: Arc::new(Semaphore::new(config.upload_concurrency.max(1))),
        }
    }

    /// Streams `href` into a hidden partial file, verifies it and renames it over `target`.
    pub async fn download_to_path_checked(
        &self,
        href: &str,
        target: &Path,
        expected_md5: Option<&str>,
        modified: Option<OffsetDateTime>,
    ) -> Result<(), TransferError> {
        let _permit = self
            .download_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        let url = Url::parse(href)?;
        let response = self.http.get(url).send().await?.error_for_status()?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target);
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut stream = response.bytes_stream();
        let mut md5 = Context::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            md5.consume(&chunk);
        }

        file.flush().await?;
        file.sync_all().await?;

        if let Some(expected_md5) = expected_md5 {
            let actual_md5 = format!("{:x}", md5.compute());
            if actual_md5 != expected_md5.to_ascii_lowercase() {
                drop(file);
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(TransferError::IntegrityMismatch {
                    expected_md5: expected_md5.to_ascii_lowercase(),
                    actual_md5,
                });
            }
        }

        match modified {
            Some(modified) => stamp_modified(file, modified).await?,
            None => drop(file),
        }
        tokio::fs::rename(partial, target).await?;
        Ok(())
    }

    /// PUTs the file body to a presigned `href`, sending the headers the signature covers.
    pub async fn upload_from_path(
        &self,
        href: &str,
        source: &Path,
        headers: &[(String, String)],
    ) -> Result<(), TransferError> {
        let _permit = self
            .upload_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        let url = Url::parse(href)?;
        let file = tokio::fs::File::open(source).await?;
        let length = file.metadata().await?.len();
        let stream = ReaderStream::new(file);
        let body = reqwest::Body::wrap_stream(stream);
        let mut request = self.http.put(url).header(CONTENT_LENGTH, length);
        for (name, value) in headers {
            if name.eq_ignore_ascii_case(CONTENT_LENGTH.as_str()) {
                continue;
            }
            request = request.header(name.as_str(), value.as_str());
        }
        request.body(body).send().await?.error_for_status()?;
        Ok(())
    }
}

impl Default for TransferClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes `bytes` next to `target` under a hidden name, stamps it and renames it into place.
pub async fn install_bytes(
    target: &Path,
    bytes: &[u8],
    modified: Option<OffsetDateTime>,
) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = partial_path(target);
    let mut file = tokio::fs::File::create(&partial).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    match modified {
        Some(modified) => stamp_modified(file, modified).await?,
        None => drop(file),
    }
    tokio::fs::rename(partial, target).await
}

async fn stamp_modified(file: tokio::fs::File, modified: OffsetDateTime) -> io::Result<()> {
    let file = file.into_std().await;
    let stamp = SystemTime::from(modified);
    tokio::task::spawn_blocking(move || file.set_modified(stamp))
        .await
        .map_err(io::Error::other)?
}

/// Dot-prefixed, so the watcher and the scanner never see half-written downloads.
pub fn partial_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.partial"))
}

fn read_limit(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
