//! Error types for the watch service

use std::io;
use std::path::PathBuf;
use thiserror::Error;
use watch_core::FsError;

/// Result type for watch service operations
pub type Result<T> = std::result::Result<T, WatchError>;

/// Errors surfaced to callers of the watch service
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("no such directory: {}", .0.display())]
    NotFound(PathBuf),

    /// The event port rejected the association (e.g. a per-process ceiling)
    #[error("failed to associate {} with the event port: {source}", path.display())]
    NativeAssociationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("watch service is closed")]
    FacilityClosed,

    /// The handle was cancelled, invalidated, or belongs to another service
    #[error("watch handle is no longer valid: {}", .0.display())]
    InvalidHandle(PathBuf),

    #[error("no events to register")]
    NoEvents,

    #[error("invalid watch config: {0}")]
    InvalidConfig(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("event port error: {0}")]
    Port(#[from] io::Error),
}

impl From<FsError> for WatchError {
    fn from(err: FsError) -> Self {
        match err {
            FsError::NotFound(path) => Self::NotFound(path),
            FsError::PermissionDenied(path) => Self::PermissionDenied(path),
            FsError::NotADirectory(path) => Self::NotADirectory(path),
            FsError::Io { path, source } => Self::Io { path, source },
        }
    }
}

/// Faults the poller absorbs locally; logged and counted, never returned
#[derive(Debug, Error)]
pub(crate) enum DispatchFault {
    #[error("suppressed spurious delete of {}", .0.display())]
    SpuriousDeleteSuppressed(PathBuf),

    #[error("skipped registration of {}: {source}", path.display())]
    ChildRegistrationSkipped {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
