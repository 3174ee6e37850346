//! Poller counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of poller activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatcherDiagnostics {
    /// Directories currently watched
    pub directories_watched: u64,

    /// Directory entries currently tracked
    pub entries_tracked: u64,

    /// Tokens currently associated with the port
    pub live_tokens: u64,

    /// File events drained from the port
    pub events_received: u64,

    /// Requests served for caller threads
    pub requests_processed: u64,

    /// Tokens released (explicitly or after an exception event)
    pub tokens_released: u64,

    /// Delete events disproven by a fresh lookup
    pub spurious_deletes_suppressed: u64,

    /// Entries that could not be associated during reconciliation
    pub child_registrations_skipped: u64,
}

/// Counters written by the poller, readable from any thread
#[derive(Debug, Default)]
pub(crate) struct Stats {
    directories_watched: AtomicU64,
    entries_tracked: AtomicU64,
    events_received: AtomicU64,
    requests_processed: AtomicU64,
    tokens_released: AtomicU64,
    spurious_deletes_suppressed: AtomicU64,
    child_registrations_skipped: AtomicU64,
}

impl Stats {
    pub(crate) fn event_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn request_processed(&self) {
        self.requests_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn token_released(&self) {
        self.tokens_released.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn spurious_delete(&self) {
        self.spurious_deletes_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn child_skipped(&self) {
        self.child_registrations_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_population(&self, directories: usize, entries: usize) {
        self.directories_watched.store(directories as u64, Ordering::Relaxed);
        self.entries_tracked.store(entries as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> WatcherDiagnostics {
        let directories_watched = self.directories_watched.load(Ordering::Relaxed);
        let entries_tracked = self.entries_tracked.load(Ordering::Relaxed);
        WatcherDiagnostics {
            directories_watched,
            entries_tracked,
            live_tokens: directories_watched + entries_tracked,
            events_received: self.events_received.load(Ordering::Relaxed),
            requests_processed: self.requests_processed.load(Ordering::Relaxed),
            tokens_released: self.tokens_released.load(Ordering::Relaxed),
            spurious_deletes_suppressed: self.spurious_deletes_suppressed.load(Ordering::Relaxed),
            child_registrations_skipped: self.child_registrations_skipped.load(Ordering::Relaxed),
        }
    }
}
