//! Lazy directory listing
//!
//! Yields the immediate children of a directory without following symbolic
//! links among them. The directory itself may be reached through one. The listing is a snapshot in time: entries created or removed while
//! iterating may or may not appear. Call [`children`] again to restart.

use crate::error::{FsError, Result};
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Iterator over the child paths of one directory
pub struct Children {
    dir: PathBuf,
    inner: walkdir::IntoIter,
}

/// List the immediate children of `dir`
///
/// Nothing is read until the iterator is advanced. A failure to open `dir`
/// itself surfaces as the first item.
pub fn children(dir: &Path) -> Children {
    let inner = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .follow_root_links(true)
        .into_iter();

    Children {
        dir: dir.to_path_buf(),
        inner,
    }
}

impl Iterator for Children {
    type Item = Result<PathBuf>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.inner.next()?;
        Some(
            entry
                .map(walkdir::DirEntry::into_path)
                .map_err(|err| map_walkdir_error(&self.dir, err)),
        )
    }
}

fn map_walkdir_error(dir: &Path, err: walkdir::Error) -> FsError {
    let path = err.path().unwrap_or(dir).to_path_buf();
    match err.into_io_error() {
        Some(source) => FsError::from_io(&path, source),
        None => FsError::Io {
            path,
            source: io::Error::new(io::ErrorKind::Other, "filesystem loop detected"),
        },
    }
}
