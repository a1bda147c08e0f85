//! taskflow-sync-core: offline-first sync for projects of tasks and connections.
//!
//! This crate provides the core functionality for:
//! - Optimistic local mutations with snapshot rollback
//! - Per-field change tracking and edit locks
//! - A persistent action queue replayed after reconnect
//! - Field-level three-way merging with tombstones and conflict records
//! - Watermark-based delta sync against a remote repository
//! - `RemoteRepository` and `LocalStore` trait abstractions

pub mod action_queue;
pub mod change_tracker;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod local_store;
pub mod model;
pub mod mutation;
pub mod optimistic;
pub mod remote;
pub mod store;

pub use action_queue::{ActionQueue, ActionQueueEntry, ActionType, EntityType, RetryPolicy};
pub use change_tracker::ChangeTracker;
pub use config::SyncConfig;
pub use conflict::{ConflictRecord, MergeContext, MergeResult, ResolutionChoice, smart_merge};
pub use coordinator::{SyncCoordinator, SyncDirection};
pub use error::{ErrorKind, Result, SyncError};
pub use events::{EventBus, NotificationLevel, PersistState, Subscription, SyncEvent};
pub use local_store::{InMemoryLocalStore, LocalStore, StoreError, Watermarks};
pub use model::{Connection, Field, Project, SyncSource, Task, TaskStatus};
pub use mutation::{Mutation, TaskPatch};
pub use optimistic::OptimisticStateManager;
pub use remote::{InMemoryRemote, RemoteError, RemoteProjectRecord, RemoteRepository};
pub use store::ProjectStore;
