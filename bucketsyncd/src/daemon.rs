use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bucketsync_core::{ObjectStoreClient, S3Store, S3StoreConfig};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::service::SyncService;
use crate::sync::engine::SyncEngine;
use crate::sync::local_watcher::{LocalEvent, WatcherConfig, start_directory_watcher};
use crate::sync::snapshot::{SnapshotPublisher, TreeSnapshot};

const DEFAULT_SYNC_DIR_NAME: &str = "BucketSync";
const DEFAULT_BUCKET: &str = "bucketsync";
const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_STABILITY_MS: u64 = 2000;
const DEFAULT_POLL_MS: u64 = 100;
const DEFAULT_REMOTE_POLL_SECS: u64 = 60;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub sync_root: PathBuf,
    pub bucket: String,
    pub endpoint_url: Option<String>,
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub stability_window: Duration,
    pub poll_interval: Duration,
    /// `None` disables the periodic remote pass.
    pub remote_poll_interval: Option<Duration>,
    pub enable_local_watcher: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let sync_root = std::env::var("BUCKETSYNC_ROOT")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| home.join(DEFAULT_SYNC_DIR_NAME));
        let bucket =
            std::env::var("BUCKETSYNC_BUCKET").unwrap_or_else(|_| DEFAULT_BUCKET.to_string());
        let endpoint_url = read_string_env("BUCKETSYNC_ENDPOINT");
        let region = read_string_env("BUCKETSYNC_REGION")
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        let stability_window = Duration::from_millis(read_u64_env(
            "BUCKETSYNC_STABILITY_MS",
            DEFAULT_STABILITY_MS,
        ));
        let poll_interval =
            Duration::from_millis(read_u64_env("BUCKETSYNC_POLL_MS", DEFAULT_POLL_MS));
        let remote_poll_interval = match std::env::var("BUCKETSYNC_REMOTE_POLL_SECS")
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
        {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(Duration::from_secs(DEFAULT_REMOTE_POLL_SECS)),
        };

        Ok(Self {
            sync_root,
            bucket,
            endpoint_url,
            region,
            access_key_id: read_string_env("BUCKETSYNC_ACCESS_KEY_ID"),
            secret_access_key: read_string_env("BUCKETSYNC_SECRET_ACCESS_KEY"),
            stability_window,
            poll_interval,
            remote_poll_interval,
            enable_local_watcher: read_bool_env("BUCKETSYNC_ENABLE_WATCHER", true),
        })
    }

    pub fn store_config(&self) -> S3StoreConfig {
        let mut config = S3StoreConfig::new(&self.bucket).with_region(&self.region);
        if let Some(endpoint) = &self.endpoint_url {
            config = config.with_endpoint_url(endpoint);
        }
        if let (Some(key_id), Some(secret)) = (&self.access_key_id, &self.secret_access_key) {
            config = config.with_credentials(key_id, secret);
        }
        config
    }

    fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            stability_window: self.stability_window,
            poll_interval: self.poll_interval,
        }
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: Arc<SyncEngine>,
    /// False until the bucket has been confirmed or created.
    bucket_ready: bool,
}

impl DaemonRuntime {
    /// Creates the root and connects the store. An unreachable store only
    /// degrades remote sync; local operations stay available.
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.sync_root)
            .await
            .with_context(|| format!("failed to create sync root at {:?}", config.sync_root))?;

        let store = S3Store::connect(config.store_config()).await;
        let client = ObjectStoreClient::new(Arc::new(store));
        let bucket_ready = client.init().await;
        if !bucket_ready {
            warn!("starting without a reachable bucket; the remote poll keeps retrying");
        }
        let mut runtime = Self::with_client(config, client);
        runtime.bucket_ready = bucket_ready;
        Ok(runtime)
    }

    /// Runtime over an already constructed client. The bucket is initialized
    /// by the first remote poll.
    pub fn with_client(config: DaemonConfig, client: ObjectStoreClient) -> Self {
        let engine = Arc::new(SyncEngine::new(client, &config.sync_root));
        Self {
            config,
            engine,
            bucket_ready: false,
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn service(&self) -> SyncService {
        SyncService::new(Arc::clone(&self.engine))
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            sync_root = %self.config.sync_root.display(),
            bucket = %self.config.bucket,
            local_watcher = self.config.enable_local_watcher,
            "started"
        );

        let (watcher, local_rx) = if self.config.enable_local_watcher {
            match start_directory_watcher(&self.config.sync_root, self.config.watcher_config()) {
                Ok((watcher, rx)) => (Some(watcher), Some(rx)),
                Err(err) => {
                    warn!(error = %err, "failed to start local watcher");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        match local_rx {
            Some(rx) => handles.push(spawn_event_loop(Arc::clone(&self.engine), rx)),
            None => {
                // Without a watcher the initial pass still has to run once.
                let _ = self.engine.publish_change(LocalEvent::Ready).await;
            }
        }
        if let Some(interval) = self.config.remote_poll_interval {
            handles.push(spawn_remote_poll(
                Arc::clone(&self.engine),
                interval,
                self.bucket_ready,
            ));
        }

        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        info!("shutting down");
        for handle in handles {
            handle.abort();
        }
        drop(watcher);
        Ok(())
    }
}

/// Snapshot of the local root alone. Never touches the object store and
/// never creates the root.
pub async fn local_tree(root: &Path) -> anyhow::Result<Arc<TreeSnapshot>> {
    SnapshotPublisher::new(root)
        .refresh()
        .await
        .with_context(|| format!("failed to scan {root:?}"))
}

fn spawn_event_loop(
    engine: Arc<SyncEngine>,
    mut rx: mpsc::UnboundedReceiver<LocalEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            // Remote work runs detached; each event gets its own task.
            let _ = engine.publish_change(event).await;
        }
    })
}

/// Periodic pull pass. While the bucket is not ready each tick retries its
/// initialization first; once it succeeds the full initial pass is rerun so
/// files changed during the outage get pushed.
fn spawn_remote_poll(
    engine: Arc<SyncEngine>,
    interval: Duration,
    mut bucket_ready: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if !bucket_ready {
                if !engine.client().init().await {
                    continue;
                }
                bucket_ready = true;
                info!("bucket reachable again, rerunning initial sync");
                if let Err(err) = engine.publish_change(LocalEvent::Ready).await.wait().await {
                    warn!(error = %err, "initial sync after reconnect failed");
                }
                continue;
            }
            match engine.force_sync().await {
                Ok(report) if !report.is_empty() => {
                    info!(
                        downloaded = report.downloaded,
                        failed = report.failed,
                        "periodic remote pass"
                    );
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "periodic remote pass failed"),
            }
        }
    })
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
