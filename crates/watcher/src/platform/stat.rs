//! Stat-snapshot event port
//!
//! Emulates one-shot file associations by recording an attribute snapshot
//! when a file is associated and comparing it against the file's current
//! attributes on every scan. Scans happen every `scan_interval`, or sooner
//! when a user event arrives.
//!
//! When a token that has fired is associated again, the snapshot observed
//! at firing time is kept as the baseline. Changes made between the firing
//! and the re-association are therefore reported on the next scan instead
//! of being absorbed into a fresh snapshot.
//!
//! A scan compares every association. Firings beyond what one wait may
//! return are queued and handed out by the following waits before the next
//! scan, so every association gets its turn.

use super::{fs_error_to_io, EventPort, FileEvents, FileObject, PortEvent, PortWaker, WatchToken};
use ahash::AHashMap;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use nix::errno::Errno;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;
use watch_core::{FileIdentity, FileTimes};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Snapshot {
    identity: FileIdentity,
    times: FileTimes,
}

#[derive(Debug)]
struct Association {
    path: PathBuf,
    events: FileEvents,
    baseline: Snapshot,
}

/// Portable [`EventPort`] backed by periodic stat(2) comparisons
pub struct StatPort {
    associations: AHashMap<WatchToken, Association>,
    /// Snapshots observed when a token last fired, awaiting re-association
    fired: AHashMap<WatchToken, Snapshot>,
    /// Fired events not yet handed out
    backlog: VecDeque<PortEvent>,
    user_tx: Sender<()>,
    user_rx: Receiver<()>,
    scan_interval: Duration,
    max_associations: usize,
    closed: bool,
}

struct StatPortWaker {
    tx: Sender<()>,
}

impl PortWaker for StatPortWaker {
    fn send_user_event(&self) -> io::Result<()> {
        self.tx.send(()).map_err(|_| io::Error::from(Errno::EBADF))
    }
}

impl StatPort {
    /// Create a port scanning every `scan_interval`, holding at most
    /// `max_associations` associations at once
    pub fn new(scan_interval: Duration, max_associations: usize) -> Self {
        let (user_tx, user_rx) = unbounded();
        Self {
            associations: AHashMap::new(),
            fired: AHashMap::new(),
            backlog: VecDeque::new(),
            user_tx,
            user_rx,
            scan_interval,
            max_associations,
            closed: false,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.associations.len()
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::from(Errno::EBADF));
        }
        Ok(())
    }

    fn snapshot(path: &Path, follow_links: bool) -> io::Result<Option<Snapshot>> {
        let attrs = watch_core::lookup(path, follow_links).map_err(fs_error_to_io)?;
        Ok(attrs.map(|attrs| Snapshot {
            identity: attrs.identity(),
            times: attrs.times(),
        }))
    }

    /// Compare every association against the filesystem, queueing what fired
    fn scan(&mut self) {
        let mut fired = Vec::new();

        for (token, association) in &self.associations {
            let follow_links = !association.events.contains(FileEvents::NOFOLLOW);
            let observed = match Self::snapshot(&association.path, follow_links) {
                Ok(observed) => observed,
                Err(err) => {
                    trace!("stat of {} failed during scan: {}", association.path.display(), err);
                    continue;
                }
            };

            let (bits, observed) = match observed {
                None => (FileEvents::DELETE, None),
                Some(now) if now.identity != association.baseline.identity => (FileEvents::RENAME_TO, None),
                Some(now) => (changed_bits(association.events, &association.baseline.times, &now.times), Some(now)),
            };

            if !bits.is_empty() {
                fired.push((*token, bits, observed));
            }
        }

        // Token order keeps scans deterministic; the backlog provides fairness
        fired.sort_by_key(|(token, _, _)| *token);
        for (token, bits, observed) in fired {
            self.associations.remove(&token);
            if let Some(observed) = observed {
                self.fired.insert(token, observed);
            }
            self.backlog.push_back(PortEvent::File { token, events: bits });
        }
    }

    /// Move queued firings into `events`, up to `max` in total
    fn hand_out(&mut self, events: &mut Vec<PortEvent>, max: usize) {
        while events.len() < max {
            match self.backlog.pop_front() {
                Some(event) => events.push(event),
                None => break,
            }
        }
    }
}

fn changed_bits(requested: FileEvents, before: &FileTimes, after: &FileTimes) -> FileEvents {
    let mut bits = FileEvents::empty();
    if requested.contains(FileEvents::MODIFIED) && before.modified != after.modified {
        bits |= FileEvents::MODIFIED;
    }
    if requested.contains(FileEvents::ATTRIB) && before.changed != after.changed {
        bits |= FileEvents::ATTRIB;
    }
    if requested.contains(FileEvents::ACCESS) && before.accessed != after.accessed {
        bits |= FileEvents::ACCESS;
    }
    bits
}

impl EventPort for StatPort {
    fn associate(&mut self, token: WatchToken, object: &FileObject, events: FileEvents) -> io::Result<()> {
        self.ensure_open()?;

        if !self.associations.contains_key(&token) && self.associations.len() >= self.max_associations {
            return Err(io::Error::from(Errno::EAGAIN));
        }

        let follow_links = !events.contains(FileEvents::NOFOLLOW);
        let current = Self::snapshot(object.path(), follow_links)?
            .ok_or_else(|| io::Error::from(Errno::ENOENT))?;

        // Kept through a failed attempt; dropped by dissociate
        let previous = self.fired.remove(&token);
        self.associations.insert(
            token,
            Association {
                path: object.path().to_path_buf(),
                events,
                baseline: previous.unwrap_or(current),
            },
        );
        Ok(())
    }

    fn dissociate(&mut self, token: WatchToken) -> io::Result<()> {
        self.ensure_open()?;
        let queued = self.backlog.len();
        self.backlog
            .retain(|event| !matches!(event, PortEvent::File { token: t, .. } if *t == token));

        let was_queued = self.backlog.len() != queued;
        let was_fired = self.fired.remove(&token).is_some();
        let was_associated = self.associations.remove(&token).is_some();
        if was_associated || was_fired || was_queued {
            Ok(())
        } else {
            Err(io::Error::from(Errno::ENOENT))
        }
    }

    fn get_events(&mut self, events: &mut Vec<PortEvent>, max: usize) -> io::Result<()> {
        self.ensure_open()?;

        loop {
            let mut woken = false;
            while self.user_rx.try_recv().is_ok() {
                woken = true;
            }
            if woken {
                events.push(PortEvent::User);
            }

            if self.backlog.is_empty() {
                self.scan();
            }
            self.hand_out(events, max);
            if !events.is_empty() {
                return Ok(());
            }

            match self.user_rx.recv_timeout(self.scan_interval) {
                Ok(()) => {
                    events.push(PortEvent::User);
                    return Ok(());
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(io::Error::from(Errno::EBADF)),
            }
        }
    }

    fn waker(&self) -> Arc<dyn PortWaker> {
        Arc::new(StatPortWaker {
            tx: self.user_tx.clone(),
        })
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        self.associations.clear();
        self.fired.clear();
        self.backlog.clear();
        Ok(())
    }
}
