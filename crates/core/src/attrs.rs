//! File identity and attribute lookup

use crate::error::{FsError, Result};
use nix::errno::Errno;
use nix::unistd::AccessFlags;
use std::fmt;
use std::fs::{self, Metadata};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Device + inode pair identifying a file independent of its path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    /// Create an identity from raw device and inode numbers
    pub const fn new(dev: u64, ino: u64) -> Self {
        Self { dev, ino }
    }

    /// Device id
    pub fn dev(&self) -> u64 {
        self.dev
    }

    /// Inode number
    pub fn ino(&self) -> u64 {
        self.ino
    }
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dev, self.ino)
    }
}

/// A timestamp with nanosecond resolution, as reported by stat(2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: i64,
}

impl Timestamp {
    pub const fn new(secs: i64, nanos: i64) -> Self {
        Self { secs, nanos }
    }
}

/// Access, modification and status-change times of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTimes {
    pub accessed: Timestamp,
    pub modified: Timestamp,
    pub changed: Timestamp,
}

/// Type of a filesystem object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    File,
    Symlink,
    Other,
}

/// Attributes of a file that exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttrs {
    identity: FileIdentity,
    kind: FileKind,
    times: FileTimes,
}

impl FileAttrs {
    fn from_metadata(metadata: &Metadata) -> Self {
        let file_type = metadata.file_type();
        let kind = if file_type.is_dir() {
            FileKind::Directory
        } else if file_type.is_file() {
            FileKind::File
        } else if file_type.is_symlink() {
            FileKind::Symlink
        } else {
            FileKind::Other
        };

        Self {
            identity: FileIdentity::new(metadata.dev(), metadata.ino()),
            kind,
            times: FileTimes {
                accessed: Timestamp::new(metadata.atime(), metadata.atime_nsec()),
                modified: Timestamp::new(metadata.mtime(), metadata.mtime_nsec()),
                changed: Timestamp::new(metadata.ctime(), metadata.ctime_nsec()),
            },
        }
    }

    pub fn identity(&self) -> FileIdentity {
        self.identity
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn times(&self) -> FileTimes {
        self.times
    }
}

/// Look up the attributes of `path`
///
/// Returns `Ok(None)` when nothing exists at `path` (including when a
/// parent component is not a directory). Symbolic links are resolved only
/// when `follow_links` is set.
pub fn lookup(path: &Path, follow_links: bool) -> Result<Option<FileAttrs>> {
    let metadata = if follow_links {
        fs::metadata(path)
    } else {
        fs::symlink_metadata(path)
    };

    match metadata {
        Ok(metadata) => Ok(Some(FileAttrs::from_metadata(&metadata))),
        Err(err) if is_absent(&err) => Ok(None),
        Err(err) => Err(FsError::from_io(path, err)),
    }
}

/// Check whether anything exists at `path`
pub fn exists(path: &Path, follow_links: bool) -> Result<bool> {
    Ok(lookup(path, follow_links)?.is_some())
}

/// Check that the calling process may read `path`
pub fn check_readable(path: &Path) -> Result<()> {
    nix::unistd::access(path, AccessFlags::R_OK).map_err(|errno| FsError::from_errno(path, errno))
}

fn is_absent(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound || err.raw_os_error() == Some(Errno::ENOTDIR as i32)
}
