//! Error taxonomy for sync operations.

use crate::action_queue::QueueError;
use crate::local_store::StoreError;
use crate::model::ValidationError;
use crate::remote::RemoteError;
use thiserror::Error;

/// Coarse classification used for retry and surfacing decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient; retried via the action queue, never blocking.
    Network,
    /// Expected; resolved by the conflict resolver and stored silently.
    Conflict,
    /// Project structurally invalid.
    Validation,
    /// User-visible, not retried.
    Quota,
    /// User-visible, not retried.
    Permission,
    /// Local coordination outcomes (busy, cancelled, missing entity).
    Local,
    /// Logged with full context; local durability preserved.
    Unknown,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Version conflict on project {project_id}: local v{local_version}, remote v{remote_version}")]
    VersionConflict {
        project_id: String,
        local_version: u64,
        remote_version: u64,
    },

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Quota exceeded: {0}")]
    Quota(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Another mutation is in progress")]
    Busy,

    #[error("Cancelled: active project changed")]
    Cancelled,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Local store error: {0}")]
    Store(#[from] StoreError),

    #[error("Action queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Network(_) => ErrorKind::Network,
            SyncError::VersionConflict { .. } => ErrorKind::Conflict,
            SyncError::Validation(_) => ErrorKind::Validation,
            SyncError::Quota(_) => ErrorKind::Quota,
            SyncError::Permission(_) => ErrorKind::Permission,
            SyncError::Busy | SyncError::Cancelled | SyncError::NotFound(_) => ErrorKind::Local,
            SyncError::Store(_) | SyncError::Queue(_) | SyncError::Unexpected(_) => {
                ErrorKind::Unknown
            }
        }
    }

    /// Whether the action queue should try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Network | ErrorKind::Conflict)
    }

    /// Whether the user should see a (non-blocking) notification.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Validation | ErrorKind::Quota | ErrorKind::Permission
        )
    }
}

impl From<RemoteError> for SyncError {
    fn from(error: RemoteError) -> Self {
        match error {
            RemoteError::Network(msg) => SyncError::Network(msg),
            RemoteError::Unsupported(op) => {
                SyncError::Unexpected(format!("remote does not support {op}"))
            }
            RemoteError::NotFound(id) => SyncError::NotFound(id),
            RemoteError::Permission(msg) => SyncError::Permission(msg),
            RemoteError::Quota(msg) => SyncError::Quota(msg),
            RemoteError::Validation(e) => SyncError::Validation(e),
            RemoteError::Other(msg) => SyncError::Unexpected(msg),
        }
    }
}
