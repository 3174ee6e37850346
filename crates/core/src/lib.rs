//! Watch Core - filesystem primitives for the watch service
//!
//! This crate provides the collaborators the watcher leans on:
//! - File identity and attribute lookup
//! - Readability checks
//! - Lazy directory listing
//! - Translation of raw I/O failures into typed errors

pub mod attrs;
pub mod dir;
pub mod error;

// Re-export main types for convenience
pub use attrs::{check_readable, exists, lookup, FileAttrs, FileIdentity, FileKind, FileTimes, Timestamp};
pub use dir::{children, Children};
pub use error::{FsError, Result};
