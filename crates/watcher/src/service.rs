//! The watch service facade

use crate::config::WatchConfig;
use crate::diagnostics::{Stats, WatcherDiagnostics};
use crate::error::{Result, WatchError};
use crate::event::Interest;
use crate::handle::{ReadyQueue, WatchHandle};
use crate::platform::{self, EventPort};
use crate::poller::Poller;
use crate::request::{Reply, Request, RequestChannel};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

/// Watches directories for entry creation, deletion and modification
///
/// Owns a background poller thread. Handles returned by
/// [`WatchService::register`] are signalled when events arrive and are
/// collected with [`WatchService::take`], [`WatchService::poll`] or
/// [`WatchService::poll_timeout`].
///
/// ```no_run
/// use watcher::{Interest, WatchService};
///
/// let service = WatchService::new()?;
/// let handle = service.register("/tmp", Interest::CREATE | Interest::DELETE)?;
/// let signalled = service.take()?;
/// for event in signalled.poll_events() {
///     println!("{:?} {:?}", event.kind(), event.name());
/// }
/// signalled.reset();
/// handle.cancel();
/// # Ok::<(), watcher::WatchError>(())
/// ```
pub struct WatchService {
    requests: Arc<RequestChannel>,
    ready: Arc<ReadyQueue>,
    stats: Arc<Stats>,
    closed: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WatchService {
    /// Start a service on the platform's default event port
    pub fn new() -> Result<Self> {
        Self::with_config(WatchConfig::default())
    }

    pub fn with_config(config: WatchConfig) -> Result<Self> {
        config.validate()?;
        let port = platform::open_port(&config)?;
        Self::with_port(port, config)
    }

    /// Start a service on a caller-supplied event port
    pub fn with_port<P: EventPort>(port: P, config: WatchConfig) -> Result<Self> {
        config.validate()?;
        let poller = Poller::new(port, config.clone());
        let requests = poller.channel();
        let ready = poller.ready();
        let stats = poller.stats();

        let worker = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || poller.run())?;

        Ok(Self {
            requests,
            ready,
            stats,
            closed: AtomicBool::new(false),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Watch directory `path` for the events in `interest`
    ///
    /// Registering a directory that is already watched, under any path,
    /// replaces its interest and returns the existing handle.
    pub fn register(&self, path: impl AsRef<Path>, interest: Interest) -> Result<WatchHandle> {
        if interest.is_empty() {
            return Err(WatchError::NoEvents);
        }
        if self.is_closed() {
            return Err(WatchError::FacilityClosed);
        }

        let path = absolute(path.as_ref())?;
        let attrs = watch_core::lookup(&path, true)?.ok_or_else(|| WatchError::NotFound(path.clone()))?;
        if !attrs.is_dir() {
            return Err(WatchError::NotADirectory(path));
        }
        watch_core::check_readable(&path)?;

        debug!("Registering {} for {:?}", path.display(), interest);
        match self.requests.submit(Request::Register { path, interest })? {
            Reply::Registered(handle) => Ok(handle),
            Reply::Done => Err(WatchError::FacilityClosed),
        }
    }

    /// Replace the interest of a registered handle
    pub fn update_interest(&self, handle: &WatchHandle, interest: Interest) -> Result<()> {
        if interest.is_empty() {
            return Err(WatchError::NoEvents);
        }
        if self.is_closed() {
            return Err(WatchError::FacilityClosed);
        }
        self.requests.submit(Request::UpdateInterest {
            handle: handle.clone(),
            interest,
        })?;
        Ok(())
    }

    /// Block until a handle is signalled
    pub fn take(&self) -> Result<WatchHandle> {
        self.ready.take()
    }

    /// Next signalled handle, if any
    pub fn poll(&self) -> Result<Option<WatchHandle>> {
        self.ready.poll()
    }

    pub fn poll_timeout(&self, timeout: Duration) -> Result<Option<WatchHandle>> {
        self.ready.poll_timeout(timeout)
    }

    /// Release every watch and stop the poller
    ///
    /// Handles become invalid and blocked [`WatchService::take`] calls
    /// return [`WatchError::FacilityClosed`]. Calling it again is a no-op.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            match self.requests.submit(Request::Close) {
                Ok(_) => debug!("Watch service closed"),
                // Poller already gone after a port failure
                Err(WatchError::FacilityClosed) => {}
                Err(e) => error!("Failed to close watch service: {}", e),
            }
        }

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!("Watch poller thread panicked");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.ready.is_closed()
    }

    pub fn diagnostics(&self) -> WatcherDiagnostics {
        self.stats.snapshot()
    }
}

impl Drop for WatchService {
    fn drop(&mut self) {
        self.close();
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|source| WatchError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(cwd.join(path))
}
