//! Directory reconciliation
//!
//! A directory association only says "something in here changed". The
//! reconciler lists the directory, picks out entries it is not yet
//! tracking, associates a token for each and reports them as created.
//!
//! Entries that disappeared are left alone: a listing is only a snapshot,
//! so removals are reported by the entries' own delete events.

use crate::diagnostics::Stats;
use crate::error::DispatchFault;
use crate::event::{EventKind, Interest};
use crate::platform::{EventPort, FileEvents, FileObject, WatchToken};
use crate::registry::{ChildEntry, Registry, TrackedNode};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use watch_core::FsError;

/// Outcome of one reconciliation pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Reconciled {
    /// Entries newly associated
    pub(crate) added: usize,
    /// Entries that could not be associated; retried on the next pass
    pub(crate) skipped: usize,
}

/// Bring the children of directory `dir` under watch
///
/// With `emit_creates` set, every untracked entry is reported as created
/// to the directory's handle, if its interest includes creation. The
/// initial pass after registration runs without it.
pub(crate) fn reconcile<P: EventPort>(
    registry: &mut Registry,
    port: &mut P,
    stats: &Stats,
    dir: WatchToken,
    emit_creates: bool,
) -> Result<Reconciled, FsError> {
    let (dir_path, interest, handle) = match registry.directory(dir) {
        Some(watch) => (watch.path().to_path_buf(), watch.interest, watch.handle.clone()),
        None => return Ok(Reconciled::default()),
    };
    let child_events = FileEvents::entry(interest.contains(Interest::MODIFY));
    let report_creates = emit_creates && interest.includes(EventKind::Create);
    let mut outcome = Reconciled::default();

    for entry in watch_core::children(&dir_path) {
        let path = match entry {
            Ok(path) => path,
            // The directory itself going away is reported by its own token
            Err(FsError::NotFound(_)) | Err(FsError::NotADirectory(_)) => {
                debug!("{} vanished during reconciliation", dir_path.display());
                return Ok(outcome);
            }
            Err(e) => return Err(e),
        };
        let name = match path.file_name() {
            Some(name) => name.to_os_string(),
            None => continue,
        };
        if registry.has_child(dir, &name) {
            continue;
        }

        match track(registry, port, dir, &path, name.clone(), child_events) {
            Ok(()) => outcome.added += 1,
            Err(source) => {
                outcome.skipped += 1;
                stats.child_skipped();
                warn!("{}", DispatchFault::ChildRegistrationSkipped { path, source });
            }
        }

        // Reported even when the entry could not be tracked; it still exists
        if report_creates {
            handle.signal_event(EventKind::Create, Some(PathBuf::from(name)));
        }
    }

    if outcome.added > 0 || outcome.skipped > 0 {
        debug!(
            "Reconciled {}: {} added, {} skipped",
            dir_path.display(),
            outcome.added,
            outcome.skipped
        );
    }
    Ok(outcome)
}

/// Associate a token for one entry and attach it to its directory
fn track<P: EventPort>(
    registry: &mut Registry,
    port: &mut P,
    dir: WatchToken,
    path: &Path,
    name: OsString,
    events: FileEvents,
) -> io::Result<()> {
    let object = FileObject::new(path)?;
    let token = registry.insert(TrackedNode::Child(ChildEntry {
        name: name.clone(),
        object,
        parent: dir,
    }));

    let associated = match registry.node(token) {
        Some(node) => port.associate(token, node.object(), events),
        None => Ok(()),
    };
    if let Err(e) = associated {
        registry.remove(token);
        return Err(e);
    }

    registry.attach_child(dir, name, token);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{ReadyQueue, WatchHandle};
    use crate::platform::fake::FakePort;
    use crate::registry::DirectoryWatch;
    use crate::request::RequestChannel;
    use ahash::AHashMap;
    use anyhow::Result;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;
    use watch_core::FileIdentity;

    struct Fixture {
        dir: TempDir,
        port: FakePort,
        registry: Registry,
        stats: Stats,
        ready: Arc<ReadyQueue>,
        token: WatchToken,
        handle: WatchHandle,
    }

    fn fixture(interest: Interest) -> Result<Fixture> {
        let dir = TempDir::new()?;
        let port = FakePort::new();
        let ready = Arc::new(ReadyQueue::new());
        let (channel, _rx) = RequestChannel::new(port.waker());
        let handle = WatchHandle::new(
            dir.path().to_path_buf(),
            FileIdentity::new(1, 1),
            interest,
            Arc::new(channel),
            &ready,
            512,
        );

        let mut registry = Registry::new();
        let token = registry.insert(TrackedNode::Directory(DirectoryWatch {
            identity: FileIdentity::new(1, 1),
            object: FileObject::new(dir.path())?,
            interest,
            handle: handle.clone(),
            children: AHashMap::new(),
        }));
        registry.index_directory(FileIdentity::new(1, 1), token);

        Ok(Fixture {
            dir,
            port,
            registry,
            stats: Stats::default(),
            ready,
            token,
            handle,
        })
    }

    impl Fixture {
        fn run(&mut self, emit_creates: bool) -> Result<Reconciled> {
            Ok(reconcile(
                &mut self.registry,
                &mut self.port,
                &self.stats,
                self.token,
                emit_creates,
            )?)
        }
    }

    #[test]
    fn test_initial_pass_tracks_without_events() -> Result<()> {
        let mut fx = fixture(Interest::all())?;
        fs::write(fx.dir.path().join("a.txt"), b"a")?;
        fs::create_dir(fx.dir.path().join("sub"))?;

        let outcome = fx.run(false)?;
        assert_eq!(outcome, Reconciled { added: 2, skipped: 0 });
        assert_eq!(fx.port.associated_count(), 2);
        assert!(fx.handle.poll_events().is_empty());
        assert_eq!(fx.ready.len(), 0);
        fx.registry.check_invariants();
        Ok(())
    }

    #[test]
    fn test_new_entries_are_reported_once() -> Result<()> {
        let mut fx = fixture(Interest::CREATE)?;
        fs::write(fx.dir.path().join("old"), b"")?;
        fx.run(false)?;

        fs::write(fx.dir.path().join("new"), b"")?;
        assert_eq!(fx.run(true)?.added, 1);
        // Already tracked on the second pass
        assert_eq!(fx.run(true)?.added, 0);

        let events = fx.handle.poll_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::Create);
        assert_eq!(events[0].name(), Some(Path::new("new")));
        assert_eq!(fx.ready.len(), 1);
        Ok(())
    }

    #[test]
    fn test_creates_filtered_by_interest() -> Result<()> {
        let mut fx = fixture(Interest::DELETE)?;
        fs::write(fx.dir.path().join("new"), b"")?;

        assert_eq!(fx.run(true)?.added, 1);
        assert!(fx.handle.poll_events().is_empty());
        Ok(())
    }

    #[test]
    fn test_child_bits_follow_modify_interest() -> Result<()> {
        let mut fx = fixture(Interest::CREATE)?;
        fs::write(fx.dir.path().join("a"), b"")?;
        fx.run(false)?;

        let token = fx.registry.child_token(fx.token, "a").unwrap();
        assert_eq!(fx.port.events_for(token), Some(FileEvents::entry(false)));
        Ok(())
    }

    #[test]
    fn test_failed_entry_is_skipped_and_retried() -> Result<()> {
        let mut fx = fixture(Interest::CREATE)?;
        let path = fx.dir.path().join("stubborn");
        fs::write(&path, b"")?;
        fx.port.fail_associations_for(&path);

        let outcome = fx.run(true)?;
        assert_eq!(outcome, Reconciled { added: 0, skipped: 1 });
        assert!(fx.registry.child_token(fx.token, "stubborn").is_none());
        assert_eq!(fx.registry.token_count(), 1);
        assert_eq!(fx.stats.snapshot().child_registrations_skipped, 1);
        // Still reported: the entry exists even if it is not tracked
        assert_eq!(fx.handle.poll_events().len(), 1);

        fx.port.allow_associations_for(&path);
        assert_eq!(fx.run(true)?.added, 1);
        assert!(fx.registry.child_token(fx.token, "stubborn").is_some());
        fx.registry.check_invariants();
        Ok(())
    }

    #[test]
    fn test_removed_entries_are_not_diffed() -> Result<()> {
        let mut fx = fixture(Interest::all())?;
        let path = fx.dir.path().join("gone");
        fs::write(&path, b"")?;
        fx.run(false)?;

        fs::remove_file(&path)?;
        fx.run(true)?;
        assert!(fx.registry.child_token(fx.token, "gone").is_some());
        assert!(fx.handle.poll_events().is_empty());
        Ok(())
    }

    #[test]
    fn test_vanished_directory_is_not_an_error() -> Result<()> {
        let mut fx = fixture(Interest::all())?;
        let path = fx.dir.path().to_path_buf();
        fs::remove_dir(&path)?;

        assert_eq!(fx.run(true)?, Reconciled::default());
        Ok(())
    }
}
