//! Event loop thread
//!
//! The poller is the only owner of the [`Registry`] and the only caller of
//! the event port's associate/dissociate. Caller threads reach it through
//! the request channel; every request and every port event is handled in
//! turn on this one thread, so no registry state is ever shared.

use crate::config::WatchConfig;
use crate::diagnostics::Stats;
use crate::error::{DispatchFault, Result, WatchError};
use crate::event::{EventKind, Interest};
use crate::handle::{ReadyQueue, WatchHandle};
use crate::reconcile::reconcile;
use crate::registry::{DirectoryWatch, Registry, TrackedNode};
use crate::platform::{EventPort, FileEvents, FileObject, PortEvent, WatchToken};
use crate::request::{Envelope, Reply, Request, RequestChannel};
use ahash::AHashMap;
use crossbeam_channel::Receiver;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollerState {
    Running,
    ShuttingDown,
    Stopped,
}

pub(crate) struct Poller<P: EventPort> {
    port: P,
    registry: Registry,
    requests: Receiver<Envelope>,
    channel: Arc<RequestChannel>,
    ready: Arc<ReadyQueue>,
    stats: Arc<Stats>,
    config: WatchConfig,
    state: PollerState,
}

impl<P: EventPort> Poller<P> {
    pub(crate) fn new(port: P, config: WatchConfig) -> Self {
        let (channel, requests) = RequestChannel::new(port.waker());
        Self {
            port,
            registry: Registry::new(),
            requests,
            channel: Arc::new(channel),
            ready: Arc::new(ReadyQueue::new()),
            stats: Arc::new(Stats::default()),
            config,
            state: PollerState::Running,
        }
    }

    pub(crate) fn channel(&self) -> Arc<RequestChannel> {
        Arc::clone(&self.channel)
    }

    pub(crate) fn ready(&self) -> Arc<ReadyQueue> {
        Arc::clone(&self.ready)
    }

    pub(crate) fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    /// Serve requests and port events until closed
    pub(crate) fn run(mut self) {
        info!("Watch poller started");
        while self.step() {}

        // Anything submitted after the close was served
        for envelope in self.requests.try_iter() {
            envelope.reply.fill(Err(WatchError::FacilityClosed));
        }
        info!("Watch poller stopped");
    }

    /// Wait for one batch of port events and dispatch it
    ///
    /// Returns false once the poller has stopped.
    pub(crate) fn step(&mut self) -> bool {
        if self.state != PollerState::Running {
            return false;
        }

        let mut events = Vec::with_capacity(self.config.max_events_per_wait);
        match self.port.get_events(&mut events, self.config.max_events_per_wait) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return true,
            Err(e) => {
                error!("Event port wait failed, shutting down: {}", e);
                self.shutdown();
                return false;
            }
        }

        for event in events {
            // Events behind a close are never delivered
            if self.state != PollerState::Running {
                break;
            }
            self.dispatch(event);
        }
        self.publish_population();

        self.state == PollerState::Running
    }

    fn publish_population(&self) {
        self.stats
            .set_population(self.registry.directory_count(), self.registry.entry_count());
    }

    pub(crate) fn dispatch(&mut self, event: PortEvent) {
        match event {
            PortEvent::User => self.process_requests(),
            PortEvent::File { token, events } => {
                self.stats.event_received();
                trace!("Port event {:?} for token {:?}", events, token);
                let is_directory = match self.registry.node(token) {
                    Some(node) => matches!(node, TrackedNode::Directory(_)),
                    None => {
                        trace!("Ignoring event for released token {:?}", token);
                        return;
                    }
                };
                if is_directory {
                    self.on_directory_event(token, events);
                } else {
                    self.on_child_event(token, events);
                }
            }
        }
    }

    /// Serve every queued request in submission order
    fn process_requests(&mut self) {
        let mut close_reply = None;

        while let Ok(Envelope { request, reply }) = self.requests.try_recv() {
            self.stats.request_processed();
            trace!("Serving {:?}", request);

            if self.state != PollerState::Running {
                reply.fill(Err(WatchError::FacilityClosed));
                continue;
            }

            let result = match request {
                Request::Register { path, interest } => self.register(&path, interest).map(Reply::Registered),
                Request::Cancel(handle) => {
                    self.cancel(&handle);
                    Ok(Reply::Done)
                }
                Request::UpdateInterest { handle, interest } => {
                    self.update_interest(&handle, interest).map(|()| Reply::Done)
                }
                Request::Close => {
                    self.state = PollerState::ShuttingDown;
                    close_reply = Some(reply);
                    continue;
                }
            };
            // Callers see counters that include their own request
            self.publish_population();
            reply.fill(result);
        }

        if let Some(reply) = close_reply {
            self.shutdown();
            reply.fill(Ok(Reply::Done));
        }
    }

    pub(crate) fn register(&mut self, path: &Path, interest: Interest) -> Result<WatchHandle> {
        let attrs = watch_core::lookup(path, true)?.ok_or_else(|| WatchError::NotFound(path.to_path_buf()))?;
        if !attrs.is_dir() {
            return Err(WatchError::NotADirectory(path.to_path_buf()));
        }
        let identity = attrs.identity();

        let existing = self
            .registry
            .directory_for(&identity)
            .and_then(|token| Some((token, self.registry.directory(token)?.handle.clone())));
        if let Some((token, handle)) = existing {
            debug!("{} already watched, updating interest to {:?}", path.display(), interest);
            self.set_directory_interest(token, interest)?;
            return Ok(handle);
        }

        let object = FileObject::new(path).map_err(|source| WatchError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let handle = WatchHandle::new(
            path.to_path_buf(),
            identity,
            interest,
            Arc::clone(&self.channel),
            &self.ready,
            self.config.max_pending_events,
        );
        let token = self.registry.insert(TrackedNode::Directory(DirectoryWatch {
            identity,
            object,
            interest,
            handle: handle.clone(),
            children: AHashMap::new(),
        }));

        if let Err(source) = self.associate(token, FileEvents::directory()) {
            self.registry.remove(token);
            handle.invalidate();
            return Err(WatchError::NativeAssociationFailed {
                path: path.to_path_buf(),
                source,
            });
        }
        self.registry.index_directory(identity, token);
        handle.mark_armed();

        match reconcile(&mut self.registry, &mut self.port, &self.stats, token, false) {
            Ok(outcome) => debug!(
                "Watching {} ({}) with {} entries",
                path.display(),
                identity,
                outcome.added
            ),
            Err(e) => warn!("Initial listing of {} failed: {}", path.display(), e),
        }
        Ok(handle)
    }

    pub(crate) fn cancel(&mut self, handle: &WatchHandle) {
        if let Some(token) = self.token_of(handle) {
            self.release_directory(token, true);
            debug!("Cancelled watch on {}", handle.path().display());
        }
        handle.invalidate();
    }

    pub(crate) fn update_interest(&mut self, handle: &WatchHandle, interest: Interest) -> Result<()> {
        match self.token_of(handle) {
            Some(token) => self.set_directory_interest(token, interest),
            None => {
                debug!("Interest update for released watch on {}", handle.path().display());
                Err(WatchError::InvalidHandle(handle.path().to_path_buf()))
            }
        }
    }

    /// Registry token of a live handle
    fn token_of(&self, handle: &WatchHandle) -> Option<WatchToken> {
        let token = self.registry.directory_for(&handle.identity())?;
        let dir = self.registry.directory(token)?;
        (dir.handle == *handle).then_some(token)
    }

    /// Replace a directory's interest, re-arming its entries if the modify
    /// bit flipped
    ///
    /// Entries that fail to re-arm are released; the first failure is
    /// returned.
    fn set_directory_interest(&mut self, token: WatchToken, interest: Interest) -> Result<()> {
        let (previous, children) = match self.registry.directory_mut(token) {
            Some(dir) => {
                let previous = dir.interest;
                dir.interest = interest;
                dir.handle.set_interest(interest);
                (previous, dir.children.values().copied().collect::<Vec<_>>())
            }
            None => return Ok(()),
        };

        let track_modify = interest.contains(Interest::MODIFY);
        if previous.contains(Interest::MODIFY) == track_modify {
            return Ok(());
        }

        let events = FileEvents::entry(track_modify);
        let mut first_error = None;
        for child in children {
            if let Err(source) = self.associate(child, events) {
                let path = self.node_path(child);
                warn!("Failed to re-arm {}: {}", path.display(), source);
                self.release_child(child, true);
                first_error.get_or_insert(WatchError::NativeAssociationFailed { path, source });
            }
        }
        debug!("Re-armed entries of token {:?} with {:?}", token, events);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn on_directory_event(&mut self, token: WatchToken, events: FileEvents) {
        if events.is_exception() {
            debug!("Watched directory {} went away ({:?})", self.node_path(token).display(), events);
            self.invalidate_directory(token, false);
            return;
        }

        if events.is_change() {
            if let Err(e) = reconcile(&mut self.registry, &mut self.port, &self.stats, token, true) {
                warn!("Failed to list {}: {}", self.node_path(token).display(), e);
            }
        }

        match self.associate(token, FileEvents::directory()) {
            Ok(()) => {
                if let Some(dir) = self.registry.directory(token) {
                    dir.handle.mark_armed();
                }
            }
            Err(e) => {
                warn!("Failed to re-arm {}: {}", self.node_path(token).display(), e);
                self.invalidate_directory(token, true);
            }
        }
    }

    fn on_child_event(&mut self, token: WatchToken, events: FileEvents) {
        let (name, path, parent) = match self.registry.child(token) {
            Some(child) => (PathBuf::from(&child.name), child.object.path().to_path_buf(), child.parent),
            None => return,
        };
        let (interest, handle) = match self.registry.directory(parent) {
            Some(dir) => (dir.interest, dir.handle.clone()),
            None => {
                self.release_child(token, false);
                return;
            }
        };

        if events.intersects(FileEvents::UNMOUNTED | FileEvents::MOUNTEDOVER) {
            self.release_child(token, false);
            return;
        }

        let mut modified = events.is_change();
        if events.intersects(FileEvents::DELETE | FileEvents::RENAME_FROM | FileEvents::RENAME_TO) {
            if self.is_gone(&path) {
                if interest.includes(EventKind::Delete) {
                    handle.signal_event(EventKind::Delete, Some(name));
                }
                self.release_child(token, false);
                return;
            }

            self.stats.spurious_delete();
            debug!("{}", DispatchFault::SpuriousDeleteSuppressed(path.clone()));
            // Name now refers to a replacement
            modified |= events.contains(FileEvents::RENAME_TO);
        }

        if modified && interest.includes(EventKind::Modify) {
            handle.signal_event(EventKind::Modify, Some(name));
        }

        if let Err(e) = self.associate(token, FileEvents::entry(interest.contains(Interest::MODIFY))) {
            warn!("Failed to re-arm {}: {}", path.display(), e);
            // Lets the port drop anything it kept for the token
            self.release_child(token, true);
        }
    }

    /// Whether a reported removal really happened
    fn is_gone(&self, path: &Path) -> bool {
        if !self.config.verify_deletes {
            return true;
        }
        match watch_core::exists(path, false) {
            Ok(exists) => !exists,
            Err(e) => {
                debug!("Delete check of {} failed, trusting the port: {}", path.display(), e);
                true
            }
        }
    }

    fn associate(&mut self, token: WatchToken, events: FileEvents) -> io::Result<()> {
        match self.registry.node(token) {
            Some(node) => self.port.associate(token, node.object(), events),
            None => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }

    fn node_path(&self, token: WatchToken) -> PathBuf {
        self.registry
            .node(token)
            .map(|node| node.object().path().to_path_buf())
            .unwrap_or_default()
    }

    /// Release a directory after an exception or a failed re-arm, and let
    /// its consumer observe the invalidation
    fn invalidate_directory(&mut self, token: WatchToken, associated: bool) {
        if let Some(handle) = self.release_directory(token, associated) {
            handle.invalidate();
            handle.signal();
        }
    }

    /// Release a directory's entries and then its own token
    ///
    /// `associated` says whether the directory's token is still associated
    /// with the port. Entries are always dissociated.
    fn release_directory(&mut self, token: WatchToken, associated: bool) -> Option<WatchHandle> {
        let dir = match self.registry.remove(token)? {
            TrackedNode::Directory(dir) => dir,
            TrackedNode::Child(_) => return None,
        };

        for child in dir.children.values() {
            self.release_child(*child, true);
        }
        if associated {
            self.dissociate(token);
        }
        self.stats.token_released();
        trace!("Released directory token {:?} for {}", token, dir.path().display());

        // Name buffer dropped here, after the port let go of it
        Some(dir.handle)
    }

    fn release_child(&mut self, token: WatchToken, associated: bool) {
        let Some(node) = self.registry.remove(token) else {
            return;
        };
        if associated {
            self.dissociate(token);
        }
        self.stats.token_released();
        trace!("Released entry token {:?} for {}", token, node.object().path().display());
    }

    fn dissociate(&mut self, token: WatchToken) {
        // A token that fired in the current batch is no longer associated
        if let Err(e) = self.port.dissociate(token) {
            trace!("Dissociating token {:?}: {}", token, e);
        }
    }

    /// Release everything, close the port and the ready queue
    fn shutdown(&mut self) {
        self.state = PollerState::ShuttingDown;

        let directories = self.registry.directory_tokens();
        let count = directories.len();
        for token in directories {
            if let Some(handle) = self.release_directory(token, true) {
                handle.invalidate();
            }
        }
        if let Err(e) = self.port.close() {
            warn!("Failed to close event port: {}", e);
        }
        self.ready.close();
        self.stats.set_population(0, 0);

        self.state = PollerState::Stopped;
        info!("Released {} watched directories", count);
    }

    #[cfg(test)]
    fn directory_token(&self, handle: &WatchHandle) -> WatchToken {
        self.token_of(handle).expect("handle is registered")
    }
}
