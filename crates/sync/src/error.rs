//! Error types for the synchronizer.

use std::path::PathBuf;

use tether_blob_store::BlobError;

/// Errors surfaced by the synchronizer.
///
/// Only configuration and setup failures abort a run; per-object failures
/// are logged where they happen and retried on a later pass or event.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The mount JSON did not parse or failed validation. Fatal.
    #[error("invalid mount configuration: {0}")]
    InvalidMountConfig(String),

    /// An invocation parameter is out of range. Fatal.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// Remote store failure, classified by the adapter
    #[error(transparent)]
    Remote(#[from] BlobError),

    /// Local filesystem failure
    #[error("local io error at {}: {}", .path.display(), .source)]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The filesystem notifier failed or lost its watch
    #[error("filesystem watcher error: {0}")]
    Watcher(#[from] notify::Error),

    /// A blocking helper task was cancelled or panicked
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl SyncError {
    pub(crate) fn local_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::LocalIo {
            path: path.into(),
            source,
        }
    }

    /// Whether this error means the whole run must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidMountConfig(_) | SyncError::InvalidOptions(_)
        )
    }
}

/// Result type alias for synchronizer operations.
pub type Result<T> = std::result::Result<T, SyncError>;
