use time::OffsetDateTime;

use crate::mtime::truncate_to_millis;
use crate::store::RemoteObjectMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    NoOp,
    UploadLocal,
    DownloadRemote,
}

/// Push direction: upload unless the remote origin mtime is the same age or newer.
///
/// A remote object without origin metadata carries no timestamp evidence, so the
/// local copy is uploaded and the object gets stamped.
pub fn push_decision(
    local_mtime: OffsetDateTime,
    remote: Option<&RemoteObjectMetadata>,
) -> SyncDecision {
    let local = truncate_to_millis(local_mtime);
    match remote.and_then(|meta| meta.original_mtime) {
        Some(remote) if truncate_to_millis(remote) >= local => SyncDecision::NoOp,
        _ => SyncDecision::UploadLocal,
    }
}

/// Pull direction: download when there is no local file, or when the remote origin
/// mtime is strictly newer. Without origin metadata freshness is undeterminable and
/// an existing local file is left alone.
pub fn pull_decision(
    local_mtime: Option<OffsetDateTime>,
    remote: &RemoteObjectMetadata,
) -> SyncDecision {
    let Some(local) = local_mtime else {
        return SyncDecision::DownloadRemote;
    };
    match remote.original_mtime {
        Some(remote) if truncate_to_millis(remote) > truncate_to_millis(local) => {
            SyncDecision::DownloadRemote
        }
        _ => SyncDecision::NoOp,
    }
}
