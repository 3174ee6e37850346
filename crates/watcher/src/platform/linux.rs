//! inotify-backed event port
//!
//! inotify watches are persistent, so the one-shot contract of an
//! association is kept here: a token fires once and stays disarmed until it
//! is associated again. Changes the kernel reports while a token is disarmed
//! are held back and fire the moment it is re-armed, so nothing between a
//! firing and the re-association is lost. Exception events end the
//! association outright.
//!
//! Several tokens can name the same inode (hard links, or a subdirectory that
//! is also watched on its own). They share one watch descriptor whose mask is
//! the union of their requests.

use super::{fs_error_to_io, EventPort, FileEvents, FileObject, PortEvent, PortWaker, WatchToken};
use ahash::AHashMap;
use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use nix::errno::Errno;
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{trace, warn};
use watch_core::FileIdentity;

const INOTIFY: Token = Token(0);
const WAKER: Token = Token(1);

#[derive(Debug)]
struct Association {
    path: PathBuf,
    events: FileEvents,
    identity: FileIdentity,
    is_dir: bool,
    /// `None` once the kernel dropped the watch
    wd: Option<WatchDescriptor>,
    armed: bool,
    /// Bits reported while disarmed
    missed: FileEvents,
}

impl Association {
    fn follows_links(&self) -> bool {
        !self.events.contains(FileEvents::NOFOLLOW)
    }

    /// Removal or replacement of the associated name, if either happened
    fn path_change(&self) -> Option<FileEvents> {
        match watch_core::lookup(&self.path, self.follows_links()) {
            Ok(None) => Some(FileEvents::DELETE),
            Ok(Some(attrs)) if attrs.identity() != self.identity => Some(FileEvents::RENAME_TO),
            Ok(Some(_)) => None,
            Err(e) => {
                trace!("stat of {} failed: {}", self.path.display(), e);
                None
            }
        }
    }

    /// Port bits for one inotify event on this association's watch
    fn translate(&self, mask: EventMask, named: bool) -> FileEvents {
        let mut bits = FileEvents::empty();
        if mask.contains(EventMask::DELETE_SELF) {
            bits |= FileEvents::DELETE;
        }
        if mask.contains(EventMask::MOVE_SELF) {
            bits |= FileEvents::RENAME_FROM;
        }
        if mask.contains(EventMask::UNMOUNT) {
            bits |= FileEvents::UNMOUNTED;
        }

        if named {
            // Events on a directory's entries; only the entry set matters
            let entries = EventMask::CREATE | EventMask::DELETE | EventMask::MOVED_FROM | EventMask::MOVED_TO;
            if self.is_dir && mask.intersects(entries) {
                bits |= FileEvents::MODIFIED;
            }
        } else {
            if mask.contains(EventMask::MODIFY) {
                bits |= FileEvents::MODIFIED;
            }
            if mask.contains(EventMask::ATTRIB) {
                bits |= FileEvents::ATTRIB;
            }
            if mask.contains(EventMask::ACCESS) {
                bits |= FileEvents::ACCESS;
            }
        }

        let bits = bits & (self.events | FileEvents::EXCEPTION);
        if bits.is_empty() || bits.is_exception() {
            return bits;
        }
        // Unlinking a file only shows up as an attribute change
        self.path_change().unwrap_or(bits)
    }
}

fn watch_mask(events: FileEvents, is_dir: bool) -> WatchMask {
    let mut mask = WatchMask::DELETE_SELF | WatchMask::MOVE_SELF;
    if events.contains(FileEvents::MODIFIED) {
        mask |= if is_dir {
            WatchMask::CREATE | WatchMask::DELETE | WatchMask::MOVED_FROM | WatchMask::MOVED_TO
        } else {
            WatchMask::MODIFY
        };
    }
    if events.contains(FileEvents::ATTRIB) {
        mask |= WatchMask::ATTRIB;
    }
    if events.contains(FileEvents::ACCESS) {
        mask |= WatchMask::ACCESS;
    }
    if events.contains(FileEvents::NOFOLLOW) {
        mask |= WatchMask::DONT_FOLLOW;
    }
    mask
}

/// [`EventPort`] backed by inotify, woken through a mio waker
pub struct InotifyPort {
    inotify: Inotify,
    poll: Poll,
    waker: Arc<Waker>,
    associations: AHashMap<WatchToken, Association>,
    watches: AHashMap<WatchDescriptor, Vec<WatchToken>>,
    /// Fired events not yet handed out
    ready: VecDeque<PortEvent>,
    max_associations: usize,
    closed: bool,
}

struct InotifyWaker {
    waker: Arc<Waker>,
}

impl PortWaker for InotifyWaker {
    fn send_user_event(&self) -> io::Result<()> {
        self.waker.wake()
    }
}

impl InotifyPort {
    /// Open a port holding at most `max_associations` associations at once
    pub fn new(max_associations: usize) -> io::Result<Self> {
        let inotify = Inotify::init()?;
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        poll.registry()
            .register(&mut SourceFd(&inotify.as_raw_fd()), INOTIFY, Interest::READABLE)?;

        Ok(Self {
            inotify,
            poll,
            waker,
            associations: AHashMap::new(),
            watches: AHashMap::new(),
            ready: VecDeque::new(),
            max_associations,
            closed: false,
        })
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::from(Errno::EBADF));
        }
        Ok(())
    }

    /// Hand out `bits` for `token`, or hold them back while it is disarmed
    fn deliver(&mut self, token: WatchToken, bits: FileEvents) {
        if bits.is_empty() {
            return;
        }
        let Some(association) = self.associations.get_mut(&token) else {
            return;
        };
        if !association.armed {
            association.missed |= bits;
            return;
        }

        association.armed = false;
        self.ready.push_back(PortEvent::File { token, events: bits });
        if bits.is_exception() {
            self.forget(token);
        }
    }

    fn forget(&mut self, token: WatchToken) -> Option<Association> {
        let association = self.associations.remove(&token)?;
        if let Some(wd) = &association.wd {
            self.unshare(token, wd, true);
        }
        Some(association)
    }

    /// Detach `token` from watch `wd`, removing the watch once unused
    fn unshare(&mut self, token: WatchToken, wd: &WatchDescriptor, remove_watch: bool) {
        let Some(tokens) = self.watches.get_mut(wd) else {
            return;
        };
        tokens.retain(|t| *t != token);
        if !tokens.is_empty() {
            return;
        }

        self.watches.remove(wd);
        if remove_watch {
            // Already gone if the kernel dropped it first
            if let Err(e) = self.inotify.watches().remove(wd.clone()) {
                trace!("Removing watch for token {:?}: {}", token, e);
            }
        }
    }

    /// Widen a shared watch to cover every token on it
    fn refresh_mask(&mut self, wd: &WatchDescriptor, path: &Path) -> io::Result<()> {
        let mask = self.watches.get(wd).into_iter().flatten().fold(WatchMask::empty(), |mask, token| {
            match self.associations.get(token) {
                Some(a) => mask | watch_mask(a.events, a.is_dir),
                None => mask,
            }
        });
        self.inotify.watches().add(path, mask)?;
        Ok(())
    }

    /// Drain the inotify queue without blocking
    fn read_kernel_events(&mut self) -> io::Result<()> {
        let mut buffer = [0u8; 4096];
        loop {
            let raw: Vec<(WatchDescriptor, EventMask, bool)> = match self.inotify.read_events(&mut buffer) {
                Ok(events) => events.map(|e| (e.wd, e.mask, e.name.is_some())).collect(),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            };
            if raw.is_empty() {
                return Ok(());
            }
            for (wd, mask, named) in raw {
                self.on_kernel_event(wd, mask, named);
            }
        }
    }

    fn on_kernel_event(&mut self, wd: WatchDescriptor, mask: EventMask, named: bool) {
        if mask.contains(EventMask::Q_OVERFLOW) {
            self.recheck_all();
            return;
        }

        if mask.contains(EventMask::IGNORED) {
            let Some(tokens) = self.watches.remove(&wd) else {
                return;
            };
            for token in tokens {
                let bits = match self.associations.get_mut(&token) {
                    Some(a) => {
                        a.wd = None;
                        a.path_change().unwrap_or(FileEvents::UNMOUNTED)
                    }
                    None => continue,
                };
                self.deliver(token, bits);
            }
            return;
        }

        let Some(tokens) = self.watches.get(&wd).cloned() else {
            return;
        };
        for token in tokens {
            let bits = match self.associations.get(&token) {
                Some(a) => a.translate(mask, named),
                None => continue,
            };
            self.deliver(token, bits);
        }
    }

    /// Events were dropped by the kernel; compare every association
    /// against the filesystem instead
    fn recheck_all(&mut self) {
        warn!("inotify queue overflowed, rechecking {} associations", self.associations.len());
        let tokens: Vec<WatchToken> = self.associations.keys().copied().collect();
        for token in tokens {
            let bits = match self.associations.get(&token) {
                Some(a) => a
                    .path_change()
                    .unwrap_or(a.events & (FileEvents::MODIFIED | FileEvents::ATTRIB)),
                None => continue,
            };
            self.deliver(token, bits);
        }
    }

    /// Block until the kernel queue or the waker is readable
    fn wait(&mut self) -> io::Result<bool> {
        let mut readiness = Events::with_capacity(4);
        match self.poll.poll(&mut readiness, None) {
            Ok(()) => Ok(readiness.iter().any(|event| event.token() == WAKER)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.associations.len()
    }
}

impl EventPort for InotifyPort {
    fn associate(&mut self, token: WatchToken, object: &FileObject, events: FileEvents) -> io::Result<()> {
        self.ensure_open()?;
        if !self.associations.contains_key(&token) && self.associations.len() >= self.max_associations {
            return Err(io::Error::from(Errno::EAGAIN));
        }

        let path = object.path();
        let attrs = watch_core::lookup(path, !events.contains(FileEvents::NOFOLLOW))
            .map_err(fs_error_to_io)?
            .ok_or_else(|| io::Error::from(Errno::ENOENT))?;
        let is_dir = attrs.is_dir();
        let wd = self.inotify.watches().add(path, watch_mask(events, is_dir))?;

        // Held-back bits survive re-association; a new file behind the name is a replacement
        let mut missed = FileEvents::empty();
        if let Some(previous) = self.associations.get(&token) {
            missed = previous.missed;
            if previous.identity != attrs.identity() {
                missed |= FileEvents::RENAME_TO;
            }
            if let Some(old) = previous.wd.clone() {
                self.unshare(token, &old, old != wd);
            }
        }

        self.associations.insert(
            token,
            Association {
                path: path.to_path_buf(),
                events,
                identity: attrs.identity(),
                is_dir,
                wd: Some(wd.clone()),
                armed: true,
                missed: FileEvents::empty(),
            },
        );
        let shared = self.watches.entry(wd.clone()).or_default();
        shared.push(token);
        if shared.len() > 1 {
            self.refresh_mask(&wd, path)?;
        }

        self.deliver(token, missed);
        Ok(())
    }

    fn dissociate(&mut self, token: WatchToken) -> io::Result<()> {
        self.ensure_open()?;
        let queued = self.ready.len();
        self.ready
            .retain(|event| !matches!(event, PortEvent::File { token: t, .. } if *t == token));
        let purged = self.ready.len() != queued;

        match self.forget(token) {
            Some(_) => Ok(()),
            None if purged => Ok(()),
            None => Err(io::Error::from(Errno::ENOENT)),
        }
    }

    fn get_events(&mut self, events: &mut Vec<PortEvent>, max: usize) -> io::Result<()> {
        self.ensure_open()?;

        let mut woken = false;
        loop {
            self.read_kernel_events()?;
            if woken || !self.ready.is_empty() {
                break;
            }
            woken = self.wait()?;
        }

        if woken {
            events.push(PortEvent::User);
        }
        while events.len() < max {
            match self.ready.pop_front() {
                Some(event) => events.push(event),
                None => break,
            }
        }
        Ok(())
    }

    fn waker(&self) -> Arc<dyn PortWaker> {
        Arc::new(InotifyWaker {
            waker: Arc::clone(&self.waker),
        })
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        for (wd, _) in self.watches.drain() {
            if let Err(e) = self.inotify.watches().remove(wd) {
                trace!("Removing watch on close: {}", e);
            }
        }
        self.associations.clear();
        self.ready.clear();
        Ok(())
    }
}
