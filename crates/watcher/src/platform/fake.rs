//! In-memory event port for tests
//!
//! Records every associate/dissociate call and lets a test fire events for
//! chosen tokens. Clones share state, so a test keeps one clone while the
//! poller owns another.

use super::{EventPort, FileEvents, FileObject, PortEvent, PortWaker, WatchToken};
use ahash::{AHashMap, AHashSet};
use crossbeam_channel::{unbounded, Receiver, Sender};
use nix::errno::Errno;
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Default)]
struct FakeState {
    associations: AHashMap<WatchToken, (PathBuf, FileEvents)>,
    associate_calls: usize,
    dissociate_calls: usize,
    failing_paths: AHashSet<PathBuf>,
    fail_wait: bool,
    closed: bool,
}

#[derive(Clone)]
pub(crate) struct FakePort {
    state: Arc<Mutex<FakeState>>,
    events_tx: Sender<PortEvent>,
    events_rx: Receiver<PortEvent>,
}

struct FakeWaker {
    tx: Sender<PortEvent>,
}

impl PortWaker for FakeWaker {
    fn send_user_event(&self) -> io::Result<()> {
        self.tx.send(PortEvent::User).map_err(|_| io::Error::from(Errno::EBADF))
    }
}

impl FakePort {
    pub(crate) fn new() -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            state: Arc::new(Mutex::new(FakeState::default())),
            events_tx,
            events_rx,
        }
    }

    /// Fire `events` for `token`, dropping its association as the kernel would
    pub(crate) fn fire(&self, token: WatchToken, events: FileEvents) -> PortEvent {
        self.state.lock().associations.remove(&token);
        PortEvent::File { token, events }
    }

    /// Fire `events` for `token` and queue the event for `get_events`
    pub(crate) fn inject(&self, token: WatchToken, events: FileEvents) {
        let event = self.fire(token, events);
        let _ = self.events_tx.send(event);
    }

    pub(crate) fn fail_associations_for(&self, path: &Path) {
        self.state.lock().failing_paths.insert(path.to_path_buf());
    }

    pub(crate) fn allow_associations_for(&self, path: &Path) {
        self.state.lock().failing_paths.remove(path);
    }

    pub(crate) fn fail_wait(&self) {
        self.state.lock().fail_wait = true;
        let _ = self.events_tx.send(PortEvent::User);
    }

    pub(crate) fn associated_count(&self) -> usize {
        self.state.lock().associations.len()
    }

    pub(crate) fn is_associated(&self, token: WatchToken) -> bool {
        self.state.lock().associations.contains_key(&token)
    }

    pub(crate) fn events_for(&self, token: WatchToken) -> Option<FileEvents> {
        self.state.lock().associations.get(&token).map(|(_, events)| *events)
    }

    pub(crate) fn tokens_for(&self, path: &Path) -> Vec<WatchToken> {
        self.state
            .lock()
            .associations
            .iter()
            .filter(|(_, (associated, _))| associated == path)
            .map(|(token, _)| *token)
            .collect()
    }

    pub(crate) fn associate_calls(&self) -> usize {
        self.state.lock().associate_calls
    }

    pub(crate) fn dissociate_calls(&self) -> usize {
        self.state.lock().dissociate_calls
    }

    /// Events queued but not yet drained by `get_events`
    pub(crate) fn pending_events(&self) -> usize {
        self.events_rx.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl EventPort for FakePort {
    fn associate(&mut self, token: WatchToken, object: &FileObject, events: FileEvents) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(io::Error::from(Errno::EBADF));
        }
        state.associate_calls += 1;
        if state.failing_paths.contains(object.path()) {
            return Err(io::Error::from(Errno::EAGAIN));
        }
        state.associations.insert(token, (object.path().to_path_buf(), events));
        Ok(())
    }

    fn dissociate(&mut self, token: WatchToken) -> io::Result<()> {
        let mut state = self.state.lock();
        state.dissociate_calls += 1;
        match state.associations.remove(&token) {
            Some(_) => Ok(()),
            None => Err(io::Error::from(Errno::ENOENT)),
        }
    }

    fn get_events(&mut self, events: &mut Vec<PortEvent>, max: usize) -> io::Result<()> {
        let first = self.events_rx.recv().map_err(|_| io::Error::from(Errno::EBADF))?;
        if self.state.lock().fail_wait {
            return Err(io::Error::from(Errno::EIO));
        }
        events.push(first);
        while events.len() < max {
            match self.events_rx.try_recv() {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
        }
        Ok(())
    }

    fn waker(&self) -> Arc<dyn PortWaker> {
        Arc::new(FakeWaker {
            tx: self.events_tx.clone(),
        })
    }

    fn close(&mut self) -> io::Result<()> {
        let mut state = self.state.lock();
        state.closed = true;
        state.associations.clear();
        Ok(())
    }
}
