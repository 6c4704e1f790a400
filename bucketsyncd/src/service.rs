//! Result-envelope boundary for collaborators (UI, IPC). Nothing crosses it as an
//! error value: every failure is logged and reported as `{success: false, error}`.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::warn;

use crate::sync::engine::{EngineError, SyncEngine};
use crate::sync::reconciler::SyncReport;
use crate::sync::snapshot::TreeSnapshot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationResult {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            success: false,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadFileResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceSyncResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<SyncReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct SyncService {
    engine: Arc<SyncEngine>,
}

impl SyncService {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }

    pub async fn create_file(
        &self,
        parent: &str,
        name: &str,
        content: Option<&[u8]>,
    ) -> OperationResult {
        envelope(
            "create file",
            self.engine.create_file(parent, name, content).await,
        )
    }

    pub async fn create_folder(&self, parent: &str, name: &str) -> OperationResult {
        envelope("create folder", self.engine.create_folder(parent, name).await)
    }

    pub async fn delete_item(&self, path: &str) -> OperationResult {
        envelope("delete", self.engine.delete_item(path).await)
    }

    pub async fn import_file(&self, source: &Path, target_dir: &str) -> OperationResult {
        envelope("import", self.engine.import_file(source, target_dir).await)
    }

    pub async fn import_file_from_buffer(
        &self,
        name: &str,
        bytes: &[u8],
        target_dir: &str,
    ) -> OperationResult {
        envelope(
            "import from buffer",
            self.engine
                .import_file_from_buffer(name, bytes, target_dir)
                .await,
        )
    }

    pub async fn move_item(&self, source: &str, target_dir: &str) -> OperationResult {
        envelope("move", self.engine.move_item(source, target_dir).await)
    }

    pub fn get_tree(&self) -> Arc<TreeSnapshot> {
        self.engine.get_tree()
    }

    pub async fn read_file(&self, path: &str) -> ReadFileResult {
        match self.engine.read_file(path).await {
            Ok(content) => ReadFileResult {
                success: true,
                content: Some(content),
                error: None,
            },
            Err(err) => ReadFileResult {
                success: false,
                content: None,
                error: Some(log_failure("read file", &err)),
            },
        }
    }

    pub async fn force_sync(&self) -> ForceSyncResult {
        match self.engine.force_sync().await {
            Ok(report) => ForceSyncResult {
                success: true,
                report: Some(report),
                error: None,
            },
            Err(err) => ForceSyncResult {
                success: false,
                report: None,
                error: Some(log_failure("force sync", &err)),
            },
        }
    }

    /// Latest snapshot, pushed on every change.
    pub fn subscribe(&self) -> watch::Receiver<Arc<TreeSnapshot>> {
        self.engine.subscribe()
    }
}

fn envelope<T>(operation: &str, result: Result<T, EngineError>) -> OperationResult {
    match result {
        Ok(_) => OperationResult::ok(),
        Err(err) => OperationResult::failed(log_failure(operation, &err)),
    }
}

fn log_failure(operation: &str, err: &EngineError) -> String {
    warn!(operation, error = %err, "operation failed");
    err.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketsync_core::{MemoryStore, ObjectStoreClient};
    use tempfile::tempdir;

    fn service(root: &Path) -> SyncService {
        let client = ObjectStoreClient::new(Arc::new(MemoryStore::new()));
        SyncService::new(Arc::new(SyncEngine::new(client, root)))
    }

    #[tokio::test]
    async fn failures_become_envelopes() {
        let dir = tempdir().unwrap();
        let service = service(dir.path());

        let result = service.delete_item("/missing.txt").await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("/missing.txt"));

        let read = service.read_file("/missing.txt").await;
        assert!(!read.success);
        assert!(read.content.is_none());
    }

    #[tokio::test]
    async fn successful_calls_carry_no_error() {
        let dir = tempdir().unwrap();
        let service = service(dir.path());

        assert_eq!(
            service.create_file("/", "a.txt", Some(b"hi")).await,
            OperationResult::ok()
        );
        let read = service.read_file("/a.txt").await;
        assert_eq!(read.content.as_deref(), Some("hi"));
        assert_eq!(service.get_tree().nodes.len(), 1);
        assert!(service.force_sync().await.success);
    }

    #[test]
    fn envelope_serializes_without_empty_fields() {
        let ok = serde_json::to_value(OperationResult::ok()).unwrap();
        assert_eq!(ok, serde_json::json!({ "success": true }));
        let failed = serde_json::to_value(OperationResult::failed("boom".into())).unwrap();
        assert_eq!(
            failed,
            serde_json::json!({ "success": false, "error": "boom" })
        );
    }
}
