use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::paths::{
    PathError, is_hidden, key_from_tree_path, local_path_for, normalize_tree_path, tree_path_for,
    tree_path_of,
};

const DEFAULT_STABILITY_WINDOW: Duration = Duration::from_millis(2000);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watcher error: {0}")]
    Notify(#[from] notify::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A change in the local tree, addressed by tree path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    /// The recursive watch is in place.
    Ready,
    Add(String),
    Change(String),
    Unlink(String),
    AddDir(String),
    UnlinkDir(String),
}

impl LocalEvent {
    /// Same event with its path in canonical tree form. File events must name
    /// an item below the root; folder events may name the root itself.
    pub fn normalized(self) -> Result<Self, PathError> {
        let item = |path: &str| Ok::<_, PathError>(tree_path_for(&key_from_tree_path(path)?));
        Ok(match self {
            LocalEvent::Ready => LocalEvent::Ready,
            LocalEvent::Add(path) => LocalEvent::Add(item(&path)?),
            LocalEvent::Change(path) => LocalEvent::Change(item(&path)?),
            LocalEvent::Unlink(path) => LocalEvent::Unlink(item(&path)?),
            LocalEvent::AddDir(path) => LocalEvent::AddDir(normalize_tree_path(&path)?),
            LocalEvent::UnlinkDir(path) => LocalEvent::UnlinkDir(normalize_tree_path(&path)?),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WatcherConfig {
    /// Quiet period without size changes before a write counts as finished.
    pub stability_window: Duration,
    pub poll_interval: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            stability_window: DEFAULT_STABILITY_WINDOW,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Raw notification, before stability checks.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RawChange {
    Written { path: String, created: bool },
    DirCreated(String),
    /// Something appeared under this path; file or folder is decided on arrival.
    Appeared(String),
    Removed { path: String, dir: bool },
    /// Rename side without direction.
    Renamed(String),
}

/// Starts a recursive watch on `root`. The returned watcher must be kept alive
/// for events to flow; `Ready` is always the first event.
pub fn start_directory_watcher(
    root: &Path,
    config: WatcherConfig,
) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<LocalEvent>), WatchError> {
    let root = std::fs::canonicalize(root)?;
    let (raw_tx, raw_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();

    let watch_root = root.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for change in map_event(&watch_root, &event) {
                let _ = raw_tx.send(change);
            }
        }
        Err(err) => warn!(error = %err, "file watcher error"),
    })?;
    watcher.watch(root.as_path(), RecursiveMode::Recursive)?;

    let _ = out_tx.send(LocalEvent::Ready);
    let debouncer = Debouncer {
        root,
        config,
        out: out_tx,
        pending: Arc::new(Mutex::new(HashMap::new())),
    };
    tokio::spawn(debouncer.run(raw_rx));
    Ok((watcher, out_rx))
}

fn map_event(root: &Path, event: &Event) -> Vec<RawChange> {
    let paths = event
        .paths
        .iter()
        .filter_map(|path| tree_path_of(root, path).ok())
        .filter(|path| path != "/" && !is_hidden(path));

    match event.kind {
        EventKind::Create(CreateKind::Folder) => paths.map(RawChange::DirCreated).collect(),
        EventKind::Create(CreateKind::File) => paths
            .map(|path| RawChange::Written {
                path,
                created: true,
            })
            .collect(),
        EventKind::Create(_) => paths.map(RawChange::Appeared).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => paths
            .map(|path| RawChange::Removed { path, dir: false })
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            paths.map(RawChange::Appeared).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Any | RenameMode::Other)) => {
            paths.map(RawChange::Renamed).collect()
        }
        // Both sides arrive separately as From and To.
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => Vec::new(),
        // Downloads restamp mtimes; that alone is not a content change.
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => paths
            .map(|path| RawChange::Written {
                path,
                created: false,
            })
            .collect(),
        EventKind::Remove(RemoveKind::Folder) => paths
            .map(|path| RawChange::Removed { path, dir: true })
            .collect(),
        EventKind::Remove(_) => paths
            .map(|path| RawChange::Removed { path, dir: false })
            .collect(),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

struct PendingWrite {
    generation: u64,
    created: bool,
    task: AbortHandle,
}

struct Debouncer {
    root: PathBuf,
    config: WatcherConfig,
    out: mpsc::UnboundedSender<LocalEvent>,
    pending: Arc<Mutex<HashMap<String, PendingWrite>>>,
}

impl Debouncer {
    async fn run(self, mut raw_rx: mpsc::UnboundedReceiver<RawChange>) {
        let mut generation = 0u64;
        while let Some(change) = raw_rx.recv().await {
            generation += 1;
            self.handle(change, generation).await;
        }
        debug!("file watcher stopped");
    }

    async fn handle(&self, change: RawChange, generation: u64) {
        match change {
            RawChange::Written { path, created } => self.schedule(path, created, generation),
            RawChange::DirCreated(path) => self.emit(LocalEvent::AddDir(path)),
            RawChange::Appeared(path) => self.appeared(path, generation).await,
            RawChange::Removed { path, dir } => self.removed(path, dir),
            RawChange::Renamed(path) => {
                if self.exists(&path).await {
                    self.appeared(path, generation).await;
                } else {
                    self.removed(path, false);
                }
            }
        }
    }

    async fn appeared(&self, path: String, generation: u64) {
        let Ok(local) = local_path_for(&self.root, &path) else {
            return;
        };
        match tokio::fs::symlink_metadata(&local).await {
            Ok(metadata) if metadata.is_dir() => self.emit(LocalEvent::AddDir(path)),
            Ok(_) => self.schedule(path, true, generation),
            Err(_) => {}
        }
    }

    fn removed(&self, path: String, dir: bool) {
        if let Some(pending) = lock(&self.pending).remove(&path) {
            pending.task.abort();
        }
        self.emit(if dir {
            LocalEvent::UnlinkDir(path)
        } else {
            LocalEvent::Unlink(path)
        });
    }

    /// (Re)starts the stability wait for a file. A newer write supersedes the
    /// pending one but keeps its "created" flag.
    fn schedule(&self, path: String, created: bool, generation: u64) {
        let Ok(local) = local_path_for(&self.root, &path) else {
            return;
        };
        let mut pending = lock(&self.pending);
        let created = match pending.remove(&path) {
            Some(previous) => {
                previous.task.abort();
                previous.created || created
            }
            None => created,
        };

        let config = self.config;
        let out = self.out.clone();
        let map = Arc::clone(&self.pending);
        let key = path.clone();
        let task = tokio::spawn(async move {
            let stable = wait_for_stable_size(&local, config).await;
            let entry = {
                let mut map = lock(&map);
                let current = map
                    .get(&key)
                    .is_some_and(|entry| entry.generation == generation);
                if current { map.remove(&key) } else { None }
            };
            if let (true, Some(entry)) = (stable, entry) {
                let event = if entry.created {
                    LocalEvent::Add(key)
                } else {
                    LocalEvent::Change(key)
                };
                let _ = out.send(event);
            }
        });
        pending.insert(
            path,
            PendingWrite {
                generation,
                created,
                task: task.abort_handle(),
            },
        );
    }

    async fn exists(&self, path: &str) -> bool {
        match local_path_for(&self.root, path) {
            Ok(local) => tokio::fs::try_exists(local).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    fn emit(&self, event: LocalEvent) {
        let _ = self.out.send(event);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Polls the file size until it stays unchanged for the stability window.
/// Returns false once the path is gone or is no longer a regular file;
/// symlinks never qualify.
async fn wait_for_stable_size(path: &Path, config: WatcherConfig) -> bool {
    let mut last_size: Option<u64> = None;
    let mut quiet_since = Instant::now();
    loop {
        tokio::time::sleep(config.poll_interval).await;
        let size = match tokio::fs::symlink_metadata(path).await {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            _ => return false,
        };
        if last_size != Some(size) {
            last_size = Some(size);
            quiet_since = Instant::now();
        }
        if quiet_since.elapsed() >= config.stability_window {
            return true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        Event {
            kind,
            paths: paths.iter().map(PathBuf::from).collect(),
            attrs: Default::default(),
        }
    }

    #[test]
    fn maps_file_creation_to_write() {
        let root = Path::new("/tmp/root");
        let mapped = map_event(
            root,
            &event(EventKind::Create(CreateKind::File), &["/tmp/root/Docs/A.txt"]),
        );
        assert_eq!(
            mapped,
            vec![RawChange::Written {
                path: "/Docs/A.txt".into(),
                created: true
            }]
        );
    }

    #[test]
    fn maps_data_modify_to_change_and_ignores_metadata() {
        let root = Path::new("/tmp/root");
        let data = map_event(
            root,
            &event(
                EventKind::Modify(ModifyKind::Data(notify::event::DataChange::Any)),
                &["/tmp/root/a.txt"],
            ),
        );
        assert_eq!(
            data,
            vec![RawChange::Written {
                path: "/a.txt".into(),
                created: false
            }]
        );
        let metadata = map_event(
            root,
            &event(
                EventKind::Modify(ModifyKind::Metadata(notify::event::MetadataKind::WriteTime)),
                &["/tmp/root/a.txt"],
            ),
        );
        assert!(metadata.is_empty());
    }

    #[test]
    fn maps_rename_sides_to_remove_and_appear() {
        let root = Path::new("/tmp/root");
        let from = map_event(
            root,
            &event(
                EventKind::Modify(ModifyKind::Name(RenameMode::From)),
                &["/tmp/root/old.txt"],
            ),
        );
        let to = map_event(
            root,
            &event(
                EventKind::Modify(ModifyKind::Name(RenameMode::To)),
                &["/tmp/root/new.txt"],
            ),
        );
        let both = map_event(
            root,
            &event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &["/tmp/root/old.txt", "/tmp/root/new.txt"],
            ),
        );
        assert_eq!(
            from,
            vec![RawChange::Removed {
                path: "/old.txt".into(),
                dir: false
            }]
        );
        assert_eq!(to, vec![RawChange::Appeared("/new.txt".into())]);
        assert!(both.is_empty());
    }

    #[test]
    fn maps_folder_events() {
        let root = Path::new("/tmp/root");
        assert_eq!(
            map_event(
                root,
                &event(EventKind::Create(CreateKind::Folder), &["/tmp/root/docs"])
            ),
            vec![RawChange::DirCreated("/docs".into())]
        );
        assert_eq!(
            map_event(
                root,
                &event(EventKind::Remove(RemoveKind::Folder), &["/tmp/root/docs"])
            ),
            vec![RawChange::Removed {
                path: "/docs".into(),
                dir: true
            }]
        );
    }

    #[test]
    fn ignores_hidden_paths_and_the_root() {
        let root = Path::new("/tmp/root");
        let mapped = map_event(
            root,
            &event(
                EventKind::Create(CreateKind::File),
                &[
                    "/tmp/root/.a.txt.partial",
                    "/tmp/root/.git/index",
                    "/tmp/root",
                    "/elsewhere/x.txt",
                ],
            ),
        );
        assert!(mapped.is_empty());
    }

    #[tokio::test]
    async fn stable_size_wait_gives_up_on_vanished_file() {
        let dir = tempdir().unwrap();
        let config = WatcherConfig {
            stability_window: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
        };
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"abc").unwrap();
        assert!(wait_for_stable_size(&path, config).await);
        std::fs::remove_file(&path).unwrap();
        assert!(!wait_for_stable_size(&path, config).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stable_size_wait_rejects_symlinks() {
        let dir = tempdir().unwrap();
        let config = WatcherConfig {
            stability_window: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
        };
        let target = dir.path().join("a.txt");
        std::fs::write(&target, b"abc").unwrap();
        let link = dir.path().join("link.txt");
        std::os::unix::fs::symlink(&target, &link).unwrap();
        assert!(!wait_for_stable_size(&link, config).await);
    }

    fn spawn_debouncer(
        root: &Path,
        config: WatcherConfig,
    ) -> (
        mpsc::UnboundedSender<RawChange>,
        mpsc::UnboundedReceiver<LocalEvent>,
    ) {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let debouncer = Debouncer {
            root: root.to_path_buf(),
            config,
            out: out_tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
        };
        tokio::spawn(debouncer.run(raw_rx));
        (raw_tx, out_rx)
    }

    #[tokio::test]
    async fn burst_of_writes_yields_one_add() {
        let dir = tempdir().unwrap();
        let config = WatcherConfig {
            stability_window: Duration::from_millis(100),
            poll_interval: Duration::from_millis(20),
        };
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        let (raw_tx, mut rx) = spawn_debouncer(dir.path(), config);

        for created in [true, false, false] {
            raw_tx
                .send(RawChange::Written {
                    path: "/a.txt".into(),
                    created,
                })
                .unwrap();
        }

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(first, Some(LocalEvent::Add("/a.txt".into())));
        let extra = tokio::time::timeout(config.stability_window * 3, rx.recv()).await;
        assert!(extra.is_err(), "unexpected second event: {extra:?}");
        drop(raw_tx);
    }

    #[tokio::test]
    async fn growing_file_is_reported_only_after_writes_stop() {
        let dir = tempdir().unwrap();
        let config = WatcherConfig {
            stability_window: Duration::from_millis(300),
            poll_interval: Duration::from_millis(20),
        };
        let path = dir.path().join("big.bin");
        std::fs::write(&path, b"").unwrap();
        let (raw_tx, mut rx) = spawn_debouncer(dir.path(), config);
        raw_tx
            .send(RawChange::Written {
                path: "/big.bin".into(),
                created: true,
            })
            .unwrap();

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            for _ in 0..45 {
                let mut file = std::fs::OpenOptions::new()
                    .append(true)
                    .open(&writer_path)
                    .unwrap();
                std::io::Write::write_all(&mut file, b"x").unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        let early = tokio::time::timeout(Duration::from_millis(700), rx.recv()).await;
        assert!(early.is_err(), "reported while still growing: {early:?}");
        writer.await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(LocalEvent::Add("/big.bin".into())));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 45);
        drop(raw_tx);
    }

    #[tokio::test]
    async fn removal_cancels_pending_write() {
        let dir = tempdir().unwrap();
        let config = WatcherConfig {
            stability_window: Duration::from_millis(100),
            poll_interval: Duration::from_millis(20),
        };
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        let (raw_tx, mut rx) = spawn_debouncer(dir.path(), config);

        raw_tx
            .send(RawChange::Written {
                path: "/a.txt".into(),
                created: true,
            })
            .unwrap();
        raw_tx
            .send(RawChange::Removed {
                path: "/a.txt".into(),
                dir: false,
            })
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(first, Some(LocalEvent::Unlink("/a.txt".into())));
        let extra = tokio::time::timeout(config.stability_window * 3, rx.recv()).await;
        assert!(extra.is_err(), "unexpected event after unlink: {extra:?}");
        drop(raw_tx);
    }

    #[tokio::test]
    async fn watcher_reports_ready_then_debounced_add() {
        let dir = tempdir().unwrap();
        let config = WatcherConfig {
            stability_window: Duration::from_millis(100),
            poll_interval: Duration::from_millis(20),
        };
        let (_watcher, mut rx) = start_directory_watcher(dir.path(), config).unwrap();
        assert_eq!(rx.recv().await, Some(LocalEvent::Ready));

        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let found = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(event) = rx.recv().await {
                if event == LocalEvent::Add("/a.txt".into()) {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(found);
    }
}
