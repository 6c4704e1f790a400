mod client;
mod memory;
mod mtime;
mod policy;
mod s3;
mod store;
mod transfer;

pub use client::{ObjectStoreClient, PutOutcome};
pub use memory::{MemoryStore, TransferCounts};
pub use mtime::{
    ORIGINAL_MTIME_KEY, format_original_mtime, from_system_time, parse_original_mtime,
    truncate_to_millis,
};
pub use policy::{SyncDecision, pull_decision, push_decision};
pub use s3::{S3Store, S3StoreConfig, StaticCredentials};
pub use store::{
    DownloadOptions, ErrorClass, ObjectStore, ObjectSummary, RemoteObjectMetadata, StoreError,
};
pub use transfer::{TransferClient, TransferConfig, TransferError, partial_path};
