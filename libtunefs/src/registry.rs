//! Stack of open handles.
//!
//! The first handle opened on a device holds its lock, so it must be the
//! last one released. Entries are pushed on open and popped in reverse
//! order by [`HandleRegistry::close_all`].

use std::path::{Path, PathBuf};

use crate::access::LockContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Per-handle state the registry owns on the handle's behalf.
#[derive(Debug)]
pub struct Registration {
    pub id: HandleId,
    pub device: PathBuf,
    pub lock: LockContext,
    /// Holds a reference on the online control descriptor.
    pub online: bool,
}

#[derive(Debug, Default)]
pub struct HandleRegistry {
    entries: Vec<Registration>,
    next_id: u64,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, device: &Path) -> HandleId {
        self.next_id += 1;
        let id = HandleId(self.next_id);
        self.entries.push(Registration {
            id,
            device: device.to_path_buf(),
            lock: LockContext::default(),
            online: false,
        });
        id
    }

    pub fn get_mut(&mut self, id: HandleId) -> Option<&mut Registration> {
        self.entries.iter_mut().find(|entry| entry.id == id)
    }

    /// Remove one entry so its owner can release what it holds.
    pub fn deregister(&mut self, id: HandleId) -> Option<Registration> {
        let pos = self.entries.iter().position(|entry| entry.id == id)?;
        Some(self.entries.remove(pos))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids from most to least recently opened.
    pub fn ids(&self) -> Vec<HandleId> {
        self.entries.iter().rev().map(|entry| entry.id).collect()
    }

    /// Pop every entry, newest first, handing each to `close`.
    pub fn close_all(&mut self, mut close: impl FnMut(Registration)) {
        while let Some(entry) = self.entries.pop() {
            close(entry);
        }
    }
}
