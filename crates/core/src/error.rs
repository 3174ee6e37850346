//! Translation of raw I/O failures into typed filesystem errors

use nix::errno::Errno;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type for filesystem operations
pub type Result<T> = std::result::Result<T, FsError>;

/// A filesystem failure, tagged with the path it concerns
#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory: {}", .0.display())]
    NotFound(PathBuf),

    #[error("permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FsError {
    /// Classify an I/O error raised while operating on `path`
    pub fn from_io(path: &Path, err: io::Error) -> Self {
        let path = path.to_path_buf();
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(path),
            _ if err.raw_os_error() == Some(Errno::ENOTDIR as i32) => Self::NotADirectory(path),
            _ => Self::Io { path, source: err },
        }
    }

    /// Classify a raw errno returned by a syscall on `path`
    pub fn from_errno(path: &Path, errno: Errno) -> Self {
        Self::from_io(path, io::Error::from(errno))
    }
}
