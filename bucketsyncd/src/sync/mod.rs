pub mod engine;
pub mod local_watcher;
pub mod paths;
pub mod reconciler;
pub mod scanner;
pub mod snapshot;
