//! Entry-level watch events

use bitflags::bitflags;
use std::path::{Path, PathBuf};

/// Type of an entry-level event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Entry created in the watched directory
    Create,
    /// Entry removed from the watched directory
    Delete,
    /// Entry content or attributes changed
    Modify,
    /// Events were lost; the consumer should rescan
    Overflow,
}

bitflags! {
    /// Event kinds a watch is interested in
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Interest: u8 {
        const CREATE = 0b0001;
        const DELETE = 0b0010;
        const MODIFY = 0b0100;
    }
}

impl Interest {
    /// Whether events of `kind` should be delivered
    ///
    /// Overflow is always delivered.
    pub fn includes(self, kind: EventKind) -> bool {
        match kind {
            EventKind::Create => self.contains(Self::CREATE),
            EventKind::Delete => self.contains(Self::DELETE),
            EventKind::Modify => self.contains(Self::MODIFY),
            EventKind::Overflow => true,
        }
    }
}

/// An event pending on a watch handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub(crate) kind: EventKind,
    pub(crate) name: Option<PathBuf>,
    pub(crate) count: u32,
}

impl WatchEvent {
    pub(crate) fn new(kind: EventKind, name: Option<PathBuf>) -> Self {
        Self { kind, name, count: 1 }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Entry name relative to the watched directory; `None` for overflow
    pub fn name(&self) -> Option<&Path> {
        self.name.as_deref()
    }

    /// Number of times this event was observed since it was queued
    pub fn count(&self) -> u32 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_includes() {
        let interest = Interest::CREATE | Interest::DELETE;
        assert!(interest.includes(EventKind::Create));
        assert!(interest.includes(EventKind::Delete));
        assert!(!interest.includes(EventKind::Modify));
        assert!(interest.includes(EventKind::Overflow));
        assert!(Interest::empty().includes(EventKind::Overflow));
    }
}
