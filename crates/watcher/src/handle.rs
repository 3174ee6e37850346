//! Watch handles and the ready queue
//!
//! A [`WatchHandle`] is the caller's view of one watched directory. The
//! poller queues entry events on it; the first event after the handle was
//! last reset moves it to the service's ready queue, where
//! [`WatchService::take`](crate::WatchService::take) picks it up.

use crate::error::{Result, WatchError};
use crate::event::{EventKind, Interest, WatchEvent};
use crate::request::{Request, RequestChannel};
use ahash::AHashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use watch_core::FileIdentity;

/// Lifecycle of a watch handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Registered, directory association not yet confirmed
    Created,
    /// Directory associated with the event port
    Armed,
    /// Cancelled or invalidated; terminal
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalState {
    Ready,
    Signalled,
}

struct KeyState {
    lifecycle: HandleState,
    signal: SignalState,
    interest: Interest,
    events: Vec<WatchEvent>,
    /// Entry name -> index of its most recent pending Modify
    last_modify: AHashMap<PathBuf, usize>,
}

impl KeyState {
    /// Queue an event, folding repeats; returns true if a new event was added
    fn push(&mut self, kind: EventKind, name: Option<PathBuf>, max_pending: usize) -> bool {
        let is_modify = kind == EventKind::Modify;

        if let Some(last) = self.events.last_mut() {
            if last.kind == EventKind::Overflow || (last.kind == kind && last.name == name) {
                last.count = last.count.saturating_add(1);
                return false;
            }
        }

        if !self.events.is_empty() {
            if let Some(name) = &name {
                if is_modify {
                    if let Some(&index) = self.last_modify.get(name) {
                        let event = &mut self.events[index];
                        event.count = event.count.saturating_add(1);
                        return false;
                    }
                } else {
                    self.last_modify.remove(name);
                }
            }

            if self.events.len() >= max_pending {
                self.events.clear();
                self.last_modify.clear();
                self.events.push(WatchEvent::new(EventKind::Overflow, None));
                return true;
            }
        }

        if is_modify {
            if let Some(name) = &name {
                self.last_modify.insert(name.clone(), self.events.len());
            }
        }
        self.events.push(WatchEvent::new(kind, name));
        true
    }
}

struct HandleInner {
    path: PathBuf,
    identity: FileIdentity,
    requests: Arc<RequestChannel>,
    ready: Weak<ReadyQueue>,
    max_pending: usize,
    state: Mutex<KeyState>,
}

/// A cancellable watch on one directory
///
/// Clones refer to the same registration; equality is identity of the
/// registration, not of the path.
#[derive(Clone)]
pub struct WatchHandle {
    inner: Arc<HandleInner>,
}

impl WatchHandle {
    pub(crate) fn new(
        path: PathBuf,
        identity: FileIdentity,
        interest: Interest,
        requests: Arc<RequestChannel>,
        ready: &Arc<ReadyQueue>,
        max_pending: usize,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                path,
                identity,
                requests,
                ready: Arc::downgrade(ready),
                max_pending,
                state: Mutex::new(KeyState {
                    lifecycle: HandleState::Created,
                    signal: SignalState::Ready,
                    interest,
                    events: Vec::new(),
                    last_modify: AHashMap::new(),
                }),
            }),
        }
    }

    /// Directory this handle watches, as registered
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Identity of the watched directory
    pub fn identity(&self) -> FileIdentity {
        self.inner.identity
    }

    /// Event kinds currently delivered
    pub fn interest(&self) -> Interest {
        self.inner.state.lock().interest
    }

    pub fn state(&self) -> HandleState {
        self.inner.state.lock().lifecycle
    }

    /// Whether the handle can still deliver events
    pub fn is_valid(&self) -> bool {
        self.state() != HandleState::Cancelled
    }

    /// Stop watching; a no-op if already cancelled
    ///
    /// Blocks until the poller has released the directory's tokens.
    pub fn cancel(&self) {
        if !self.is_valid() {
            return;
        }
        match self.inner.requests.submit(Request::Cancel(self.clone())) {
            Ok(_) => {}
            // Shutdown invalidates every handle anyway
            Err(WatchError::FacilityClosed) => debug!("cancel of {} after close", self.path().display()),
            Err(e) => warn!("Failed to cancel watch on {}: {}", self.path().display(), e),
        }
    }

    /// Take all pending events
    pub fn poll_events(&self) -> Vec<WatchEvent> {
        let mut state = self.inner.state.lock();
        state.last_modify.clear();
        std::mem::take(&mut state.events)
    }

    /// Make a signalled handle eligible for the ready queue again
    ///
    /// If events arrived since the last [`WatchHandle::poll_events`] the
    /// handle is re-queued immediately. Returns whether the handle is valid.
    pub fn reset(&self) -> bool {
        let mut state = self.inner.state.lock();
        let valid = state.lifecycle != HandleState::Cancelled;
        if valid && state.signal == SignalState::Signalled {
            if state.events.is_empty() {
                state.signal = SignalState::Ready;
            } else {
                self.enqueue();
            }
        }
        valid
    }

    pub(crate) fn set_interest(&self, interest: Interest) {
        self.inner.state.lock().interest = interest;
    }

    pub(crate) fn mark_armed(&self) {
        let mut state = self.inner.state.lock();
        if state.lifecycle == HandleState::Created {
            state.lifecycle = HandleState::Armed;
        }
    }

    pub(crate) fn invalidate(&self) {
        self.inner.state.lock().lifecycle = HandleState::Cancelled;
    }

    /// Queue an entry event and signal the handle
    pub(crate) fn signal_event(&self, kind: EventKind, name: Option<PathBuf>) {
        let mut state = self.inner.state.lock();
        if state.push(kind, name, self.inner.max_pending) {
            self.signal_locked(&mut state);
        }
    }

    /// Signal without an event, so consumers observe an invalidation
    pub(crate) fn signal(&self) {
        let mut state = self.inner.state.lock();
        self.signal_locked(&mut state);
    }

    fn signal_locked(&self, state: &mut KeyState) {
        if state.signal == SignalState::Ready {
            state.signal = SignalState::Signalled;
            self.enqueue();
        }
    }

    fn enqueue(&self) {
        if let Some(ready) = self.inner.ready.upgrade() {
            ready.push(self.clone());
        }
    }
}

impl PartialEq for WatchHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for WatchHandle {}

impl Hash for WatchHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as usize).hash(state);
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("path", &self.inner.path)
            .field("identity", &self.inner.identity)
            .field("state", &self.state())
            .finish()
    }
}

/// Signalled handles waiting to be taken
pub(crate) struct ReadyQueue {
    inner: Mutex<ReadyInner>,
    available: Condvar,
}

struct ReadyInner {
    handles: VecDeque<WatchHandle>,
    closed: bool,
}

impl ReadyQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(ReadyInner {
                handles: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    pub(crate) fn push(&self, handle: WatchHandle) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.handles.push_back(handle);
        self.available.notify_one();
    }

    /// Block until a handle is signalled
    pub(crate) fn take(&self) -> Result<WatchHandle> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Err(WatchError::FacilityClosed);
            }
            if let Some(handle) = inner.handles.pop_front() {
                return Ok(handle);
            }
            self.available.wait(&mut inner);
        }
    }

    pub(crate) fn poll(&self) -> Result<Option<WatchHandle>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(WatchError::FacilityClosed);
        }
        Ok(inner.handles.pop_front())
    }

    pub(crate) fn poll_timeout(&self, timeout: Duration) -> Result<Option<WatchHandle>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Err(WatchError::FacilityClosed);
            }
            if let Some(handle) = inner.handles.pop_front() {
                return Ok(Some(handle));
            }
            if self.available.wait_until(&mut inner, deadline).timed_out() {
                if inner.closed {
                    return Err(WatchError::FacilityClosed);
                }
                return Ok(inner.handles.pop_front());
            }
        }
    }

    /// Refuse further handles and wake every blocked taker
    pub(crate) fn close(&self) {
        let drained = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            std::mem::take(&mut inner.handles)
        };
        self.available.notify_all();
        drop(drained);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().handles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::FakePort;
    use crate::platform::EventPort;
    use std::thread;

    fn handle_with_capacity(ready: &Arc<ReadyQueue>, max_pending: usize) -> WatchHandle {
        let port = FakePort::new();
        let (channel, _rx) = RequestChannel::new(port.waker());
        WatchHandle::new(
            PathBuf::from("/watched"),
            FileIdentity::new(1, 2),
            Interest::all(),
            Arc::new(channel),
            ready,
            max_pending,
        )
    }

    fn name(s: &str) -> Option<PathBuf> {
        Some(PathBuf::from(s))
    }

    #[test]
    fn test_first_event_queues_handle_once() {
        let ready = Arc::new(ReadyQueue::new());
        let handle = handle_with_capacity(&ready, 512);

        handle.signal_event(EventKind::Create, name("a"));
        handle.signal_event(EventKind::Create, name("b"));
        assert_eq!(ready.len(), 1);

        let taken = ready.poll().unwrap().unwrap();
        assert_eq!(taken, handle);
        let events = taken.poll_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name(), Some(Path::new("a")));
    }

    #[test]
    fn test_repeated_events_are_counted() {
        let ready = Arc::new(ReadyQueue::new());
        let handle = handle_with_capacity(&ready, 512);

        handle.signal_event(EventKind::Modify, name("a"));
        handle.signal_event(EventKind::Modify, name("a"));
        handle.signal_event(EventKind::Create, name("b"));
        // Latest modify for "a" is still pending, so it is folded in
        handle.signal_event(EventKind::Modify, name("a"));

        let events = handle.poll_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), EventKind::Modify);
        assert_eq!(events[0].count(), 3);
        assert_eq!(events[1].kind(), EventKind::Create);
    }

    #[test]
    fn test_delete_breaks_modify_folding() {
        let ready = Arc::new(ReadyQueue::new());
        let handle = handle_with_capacity(&ready, 512);

        handle.signal_event(EventKind::Modify, name("a"));
        handle.signal_event(EventKind::Delete, name("a"));
        handle.signal_event(EventKind::Create, name("a"));
        handle.signal_event(EventKind::Modify, name("a"));

        let kinds: Vec<_> = handle.poll_events().iter().map(WatchEvent::kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::Modify, EventKind::Delete, EventKind::Create, EventKind::Modify]
        );
    }

    #[test]
    fn test_overflow_replaces_pending_events() {
        let ready = Arc::new(ReadyQueue::new());
        let handle = handle_with_capacity(&ready, 3);

        for n in 0..3 {
            handle.signal_event(EventKind::Create, name(&format!("f{}", n)));
        }
        handle.signal_event(EventKind::Create, name("f3"));
        handle.signal_event(EventKind::Delete, name("f0"));

        let events = handle.poll_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::Overflow);
        assert_eq!(events[0].name(), None);
        assert_eq!(events[0].count(), 2);
    }

    #[test]
    fn test_reset_requeues_when_events_pending() {
        let ready = Arc::new(ReadyQueue::new());
        let handle = handle_with_capacity(&ready, 512);

        handle.signal_event(EventKind::Create, name("a"));
        let taken = ready.poll().unwrap().unwrap();
        taken.poll_events();

        // Arrives while the consumer holds the handle: no second queue entry
        handle.signal_event(EventKind::Delete, name("a"));
        assert_eq!(ready.len(), 0);

        assert!(taken.reset());
        assert_eq!(ready.len(), 1);
        let again = ready.poll().unwrap().unwrap();
        assert_eq!(again.poll_events().len(), 1);

        // Nothing pending: back to ready without queueing
        assert!(again.reset());
        assert_eq!(ready.len(), 0);
        handle.signal_event(EventKind::Create, name("b"));
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn test_lifecycle() {
        let ready = Arc::new(ReadyQueue::new());
        let handle = handle_with_capacity(&ready, 512);
        assert_eq!(handle.state(), HandleState::Created);

        handle.mark_armed();
        assert_eq!(handle.state(), HandleState::Armed);
        assert!(handle.is_valid());

        handle.invalidate();
        handle.mark_armed();
        assert_eq!(handle.state(), HandleState::Cancelled);
        assert!(!handle.is_valid());
        assert!(!handle.reset());

        // Already cancelled: no request is sent
        handle.cancel();
    }

    #[test]
    fn test_take_blocks_until_signalled() {
        let ready = Arc::new(ReadyQueue::new());
        let handle = handle_with_capacity(&ready, 512);

        let signaller = {
            let handle = handle.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                handle.signal_event(EventKind::Create, name("late"));
            })
        };

        assert_eq!(ready.take().unwrap(), handle);
        signaller.join().unwrap();
    }

    #[test]
    fn test_close_wakes_takers() {
        let ready = Arc::new(ReadyQueue::new());
        let taker = {
            let ready = Arc::clone(&ready);
            thread::spawn(move || ready.take())
        };

        thread::sleep(Duration::from_millis(50));
        ready.close();
        assert!(matches!(taker.join().unwrap(), Err(WatchError::FacilityClosed)));
        assert!(matches!(ready.poll(), Err(WatchError::FacilityClosed)));
        assert!(ready.is_closed());
    }

    #[test]
    fn test_poll_timeout_expires() {
        let ready = Arc::new(ReadyQueue::new());
        let started = Instant::now();
        assert!(ready.poll_timeout(Duration::from_millis(30)).unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
