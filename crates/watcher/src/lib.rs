//! Directory change notification
//!
//! This crate turns a coarse, one-shot, per-file event facility into
//! per-entry create/delete/modify events for watched directories:
//! - A single poller thread owns all watch state
//! - Callers talk to it over a request channel and never share a lock with it
//! - Directory changes are reconciled against a fresh listing to find new entries
//! - Every tracked entry carries its own association, which reports removals
//!
//! Start with [`WatchService`].

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod event;
pub mod handle;
pub mod platform;
pub mod service;

mod poller;
mod reconcile;
mod registry;
mod request;

pub use config::{PortBackend, WatchConfig};
pub use diagnostics::WatcherDiagnostics;
pub use error::{Result, WatchError};
pub use event::{EventKind, Interest, WatchEvent};
pub use handle::{HandleState, WatchHandle};
pub use platform::{open_port, EventPort, FileEvents, FileObject, PortEvent, PortWaker, StatPort, WatchToken};
pub use service::WatchService;

#[cfg(target_os = "linux")]
pub use platform::InotifyPort;
