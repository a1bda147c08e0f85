//! taskflow-sync-daemon library: file-backed hosts for the sync core.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod config;
pub mod directory_remote;
pub mod file_store;
pub mod watcher;

// Re-export key types for convenience
pub use config::DaemonConfig;
pub use directory_remote::DirectoryRemote;
pub use file_store::FileLocalStore;
pub use watcher::{RemoteChange, RemoteWatcher};
