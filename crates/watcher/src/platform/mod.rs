//! Native event facility
//!
//! The watcher is written against an event-port style facility: a
//! multiplexing handle to which individual files are *associated* under an
//! opaque token. An association is one-shot: once an event is delivered for a
//! token it must be associated again before further events arrive. A
//! synthetic user event can be sent from any thread to wake a blocked wait.
//!
//! [`EventPort`] is the seam. [`InotifyPort`] backs it with kernel
//! notifications on Linux; [`StatPort`] is the portable fallback.

#[cfg(target_os = "linux")]
mod linux;
mod stat;

#[cfg(test)]
pub(crate) mod fake;

#[cfg(target_os = "linux")]
pub use linux::InotifyPort;
pub use stat::StatPort;

use crate::config::{PortBackend, WatchConfig};
use bitflags::bitflags;
use nix::errno::Errno;
use std::ffi::{CString, OsStr};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use watch_core::FsError;

/// Opaque token under which a file is associated with an event port
///
/// Tokens are handed out by the watcher's registry. A released token is
/// never handed out again with the same generation, so a stale token cannot
/// alias a newer association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchToken {
    index: u32,
    generation: u32,
}

impl WatchToken {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }
}

/// The native name buffer of an association
///
/// Holds a NUL-terminated copy of the path bytes. Not `Clone`: exactly one
/// exists per live token and it is dropped when the token is released.
#[derive(Debug)]
pub struct FileObject {
    name: CString,
}

impl FileObject {
    pub fn new(path: &Path) -> io::Result<Self> {
        let name = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path contains an interior NUL byte: {}", path.display()),
            )
        })?;
        Ok(Self { name })
    }

    pub fn path(&self) -> &Path {
        Path::new(OsStr::from_bytes(self.name.as_bytes()))
    }
}

bitflags! {
    /// Event bits of a file association
    ///
    /// Values match the native `port_associate` file event flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FileEvents: u32 {
        const ACCESS = 0x0000_0001;
        const MODIFIED = 0x0000_0002;
        const ATTRIB = 0x0000_0004;
        const DELETE = 0x0000_0010;
        const RENAME_TO = 0x0000_0020;
        const RENAME_FROM = 0x0000_0040;
        const NOFOLLOW = 0x1000_0000;
        const UNMOUNTED = 0x2000_0000;
        const MOUNTEDOVER = 0x4000_0000;

        /// Delivered whether requested or not; the association is gone afterwards
        const EXCEPTION = Self::DELETE.bits()
            | Self::RENAME_TO.bits()
            | Self::RENAME_FROM.bits()
            | Self::UNMOUNTED.bits()
            | Self::MOUNTEDOVER.bits();
    }
}

impl FileEvents {
    /// Bits a watched directory is associated with
    ///
    /// A directory registered through a symbolic link is watched at its
    /// target, so the link is followed.
    pub const fn directory() -> Self {
        Self::MODIFIED.union(Self::ATTRIB)
    }

    /// Bits a tracked directory entry is associated with
    ///
    /// Entries only need content/attribute events when modifications are
    /// wanted; exception events arrive regardless.
    pub const fn entry(track_modify: bool) -> Self {
        if track_modify {
            Self::MODIFIED.union(Self::ATTRIB).union(Self::NOFOLLOW)
        } else {
            Self::NOFOLLOW
        }
    }

    /// Whether content or attributes changed
    pub fn is_change(self) -> bool {
        self.intersects(Self::MODIFIED | Self::ATTRIB)
    }

    /// Whether the associated object went away
    pub fn is_exception(self) -> bool {
        self.intersects(Self::EXCEPTION)
    }
}

/// An event drained from the port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEvent {
    /// Synthetic wake-up sent through a [`PortWaker`]
    User,
    /// A file association fired
    File { token: WatchToken, events: FileEvents },
}

/// Sends synthetic wake-ups to a port from any thread
pub trait PortWaker: Send + Sync {
    fn send_user_event(&self) -> io::Result<()>;
}

/// A native event port
///
/// Owned by exactly one thread; only the waker crosses threads.
pub trait EventPort: Send + 'static {
    /// Associate the file named by `object` under `token`
    ///
    /// Associating a token that is already associated replaces the
    /// association.
    fn associate(&mut self, token: WatchToken, object: &FileObject, events: FileEvents) -> io::Result<()>;

    /// Remove the association for `token`
    fn dissociate(&mut self, token: WatchToken) -> io::Result<()>;

    /// Block until at least one event is pending, then drain up to `max`
    fn get_events(&mut self, events: &mut Vec<PortEvent>, max: usize) -> io::Result<()>;

    /// Handle for waking a blocked [`EventPort::get_events`]
    fn waker(&self) -> Arc<dyn PortWaker>;

    /// Release the port; all associations are dropped
    fn close(&mut self) -> io::Result<()>;
}

/// Native error code for a failed attribute lookup
pub(crate) fn fs_error_to_io(err: FsError) -> io::Error {
    match err {
        FsError::NotFound(_) => io::Error::from(Errno::ENOENT),
        FsError::PermissionDenied(_) => io::Error::from(Errno::EACCES),
        FsError::NotADirectory(_) => io::Error::from(Errno::ENOTDIR),
        FsError::Io { source, .. } => source,
    }
}

impl<P: EventPort + ?Sized> EventPort for Box<P> {
    fn associate(&mut self, token: WatchToken, object: &FileObject, events: FileEvents) -> io::Result<()> {
        (**self).associate(token, object, events)
    }

    fn dissociate(&mut self, token: WatchToken) -> io::Result<()> {
        (**self).dissociate(token)
    }

    fn get_events(&mut self, events: &mut Vec<PortEvent>, max: usize) -> io::Result<()> {
        (**self).get_events(events, max)
    }

    fn waker(&self) -> Arc<dyn PortWaker> {
        (**self).waker()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// Open the event port selected by `config.backend`
pub fn open_port(config: &WatchConfig) -> io::Result<Box<dyn EventPort>> {
    match config.backend {
        PortBackend::Native => native_port(config),
        PortBackend::Stat => Ok(Box::new(stat_port(config))),
    }
}

fn stat_port(config: &WatchConfig) -> StatPort {
    StatPort::new(Duration::from_millis(config.poll_interval_ms), config.max_associations)
}

#[cfg(target_os = "linux")]
fn native_port(config: &WatchConfig) -> io::Result<Box<dyn EventPort>> {
    match InotifyPort::new(config.max_associations) {
        Ok(port) => {
            debug!("Opened inotify event port");
            Ok(Box::new(port))
        }
        Err(e) => {
            warn!("inotify unavailable, falling back to stat scans: {}", e);
            Ok(Box::new(stat_port(config)))
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn native_port(config: &WatchConfig) -> io::Result<Box<dyn EventPort>> {
    debug!("No kernel notification backend, using stat scans");
    Ok(Box::new(stat_port(config)))
}
