//! Watch token registry
//!
//! Maps file identities to watched directories and tokens to the node they
//! represent. The registry is owned by the poller and never leaves its
//! thread, so nothing here is locked.

use crate::event::Interest;
use crate::handle::WatchHandle;
use crate::platform::{FileObject, WatchToken};
use ahash::AHashMap;
use std::ffi::{OsStr, OsString};
use std::path::Path;
use watch_core::FileIdentity;

/// Generational slot table keyed by [`WatchToken`]
///
/// Removing a value bumps its slot's generation, so the removed token no
/// longer resolves even after the slot is reused.
pub(crate) struct TokenTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

impl<T> TokenTable<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub(crate) fn insert(&mut self, value: T) -> WatchToken {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return WatchToken::new(index, slot.generation);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        WatchToken::new(index, 0)
    }

    fn slot(&self, token: WatchToken) -> Option<&Slot<T>> {
        self.slots
            .get(token.index() as usize)
            .filter(|slot| slot.generation == token.generation())
    }

    pub(crate) fn get(&self, token: WatchToken) -> Option<&T> {
        self.slot(token).and_then(|slot| slot.value.as_ref())
    }

    pub(crate) fn get_mut(&mut self, token: WatchToken) -> Option<&mut T> {
        self.slots
            .get_mut(token.index() as usize)
            .filter(|slot| slot.generation == token.generation())
            .and_then(|slot| slot.value.as_mut())
    }

    pub(crate) fn remove(&mut self, token: WatchToken) -> Option<T> {
        let slot = self
            .slots
            .get_mut(token.index() as usize)
            .filter(|slot| slot.generation == token.generation())?;
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(token.index());
        self.len -= 1;
        Some(value)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub(crate) fn tokens(&self) -> impl Iterator<Item = WatchToken> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|_| WatchToken::new(index as u32, slot.generation))
        })
    }
}

/// A watched directory
pub(crate) struct DirectoryWatch {
    pub(crate) identity: FileIdentity,
    pub(crate) object: FileObject,
    pub(crate) interest: Interest,
    pub(crate) handle: WatchHandle,
    /// Entry name -> token of the tracked entry
    pub(crate) children: AHashMap<OsString, WatchToken>,
}

impl DirectoryWatch {
    pub(crate) fn path(&self) -> &Path {
        self.object.path()
    }
}

/// A tracked entry of a watched directory
pub(crate) struct ChildEntry {
    pub(crate) name: OsString,
    pub(crate) object: FileObject,
    /// Token of the owning directory; not an ownership edge
    pub(crate) parent: WatchToken,
}

/// What a token stands for
pub(crate) enum TrackedNode {
    Directory(DirectoryWatch),
    Child(ChildEntry),
}

impl TrackedNode {
    pub(crate) fn object(&self) -> &FileObject {
        match self {
            Self::Directory(dir) => &dir.object,
            Self::Child(child) => &child.object,
        }
    }
}

/// Identity and token maps for everything the poller has associated
pub(crate) struct Registry {
    nodes: TokenTable<TrackedNode>,
    directories: AHashMap<FileIdentity, WatchToken>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            nodes: TokenTable::new(),
            directories: AHashMap::new(),
        }
    }

    pub(crate) fn node(&self, token: WatchToken) -> Option<&TrackedNode> {
        self.nodes.get(token)
    }

    pub(crate) fn directory(&self, token: WatchToken) -> Option<&DirectoryWatch> {
        match self.nodes.get(token)? {
            TrackedNode::Directory(dir) => Some(dir),
            TrackedNode::Child(_) => None,
        }
    }

    pub(crate) fn directory_mut(&mut self, token: WatchToken) -> Option<&mut DirectoryWatch> {
        match self.nodes.get_mut(token)? {
            TrackedNode::Directory(dir) => Some(dir),
            TrackedNode::Child(_) => None,
        }
    }

    pub(crate) fn child(&self, token: WatchToken) -> Option<&ChildEntry> {
        match self.nodes.get(token)? {
            TrackedNode::Child(child) => Some(child),
            TrackedNode::Directory(_) => None,
        }
    }

    /// Token of the watched directory with `identity`
    pub(crate) fn directory_for(&self, identity: &FileIdentity) -> Option<WatchToken> {
        self.directories.get(identity).copied()
    }

    /// Store a node that is about to be associated
    ///
    /// Directories are not findable by identity until [`Registry::index_directory`].
    pub(crate) fn insert(&mut self, node: TrackedNode) -> WatchToken {
        self.nodes.insert(node)
    }

    /// Make an associated directory findable by its identity
    pub(crate) fn index_directory(&mut self, identity: FileIdentity, token: WatchToken) {
        self.directories.insert(identity, token);
    }

    /// Record `child` under its parent's entry map
    pub(crate) fn attach_child(&mut self, parent: WatchToken, name: OsString, child: WatchToken) {
        if let Some(dir) = self.directory_mut(parent) {
            dir.children.insert(name, child);
        }
    }

    /// Remove a node, unlinking it from its parent or identity index
    ///
    /// A directory's children stay in the table; the caller releases them.
    pub(crate) fn remove(&mut self, token: WatchToken) -> Option<TrackedNode> {
        let node = self.nodes.remove(token)?;
        match &node {
            TrackedNode::Directory(dir) => {
                if self.directories.get(&dir.identity) == Some(&token) {
                    self.directories.remove(&dir.identity);
                }
            }
            TrackedNode::Child(child) => {
                if let Some(dir) = self.directory_mut(child.parent) {
                    if dir.children.get(&child.name) == Some(&token) {
                        dir.children.remove(&child.name);
                    }
                }
            }
        }
        Some(node)
    }

    pub(crate) fn has_child(&self, parent: WatchToken, name: &OsStr) -> bool {
        self.directory(parent)
            .map(|dir| dir.children.contains_key(name))
            .unwrap_or(false)
    }

    pub(crate) fn directory_tokens(&self) -> Vec<WatchToken> {
        self.directories.values().copied().collect()
    }

    pub(crate) fn directory_count(&self) -> usize {
        self.directories.len()
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.nodes.len() - self.directories.len()
    }

    #[cfg(test)]
    pub(crate) fn token_count(&self) -> usize {
        self.nodes.len()
    }

    /// Token of the tracked entry `name` under `parent`
    #[cfg(test)]
    pub(crate) fn child_token(&self, parent: WatchToken, name: &str) -> Option<WatchToken> {
        self.directory(parent)?.children.get(OsStr::new(name)).copied()
    }

    /// Assert the cross-map invariants hold
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        for (identity, token) in &self.directories {
            let dir = self.directory(*token).expect("indexed identity resolves to a directory");
            assert_eq!(&dir.identity, identity);
            for (name, child_token) in &dir.children {
                let child = self.child(*child_token).expect("listed child resolves");
                assert_eq!(&child.name, name);
                assert_eq!(child.parent, *token);
            }
        }

        let listed: usize = self
            .directories
            .values()
            .filter_map(|token| self.directory(*token))
            .map(|dir| dir.children.len())
            .sum();
        assert_eq!(listed + self.directories.len(), self.nodes.len(), "no orphaned tokens");

        for token in self.nodes.tokens() {
            if let Some(TrackedNode::Child(child)) = self.nodes.get(token) {
                assert!(self.directory(child.parent).is_some(), "child's parent is live");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removed_token_never_resolves() {
        let mut table = TokenTable::new();
        let first = table.insert("first");
        assert_eq!(table.get(first), Some(&"first"));

        assert_eq!(table.remove(first), Some("first"));
        assert_eq!(table.get(first), None);
        assert_eq!(table.remove(first), None);

        // Slot is reused under a new generation
        let second = table.insert("second");
        assert_eq!(second.index(), first.index());
        assert_ne!(second, first);
        assert_eq!(table.get(first), None);
        assert_eq!(table.get(second), Some(&"second"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_tokens_lists_live_slots() {
        let mut table = TokenTable::new();
        let a = table.insert(1);
        let b = table.insert(2);
        let c = table.insert(3);
        table.remove(b);

        let mut live: Vec<_> = table.tokens().collect();
        live.sort();
        assert_eq!(live, vec![a, c]);

        *table.get_mut(c).unwrap() = 30;
        assert_eq!(table.get(c), Some(&30));
    }
}
