//! Copy-on-write scratch overlay over committed state.
//!
//! A transaction executes entirely against its own overlay. Every key the
//! transaction reads is cached as a clean entry and every key it writes or
//! deletes becomes a dirty entry, so after execution the overlay knows the
//! full set of keys the transaction depended on. Committed state is only
//! touched by [`ScratchStore::write`].

use crate::store::StateStore;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
struct CacheEntry {
    /// `None` marks a missing key (on read) or a deletion (when dirty).
    value: Option<Vec<u8>>,
    dirty: bool,
}

/// An isolated view of state that records reads and buffers writes.
pub struct ScratchStore {
    parent: Arc<dyn StateStore>,
    cache: BTreeMap<Vec<u8>, CacheEntry>,
}

impl ScratchStore {
    /// Creates an empty overlay over `parent`.
    pub fn new(parent: Arc<dyn StateStore>) -> Self {
        Self {
            parent,
            cache: BTreeMap::new(),
        }
    }

    /// Reads a key, falling through to the parent on first access.
    pub fn get(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        if let Some(entry) = self.cache.get(key) {
            return entry.value.clone();
        }
        let value = self.parent.get(key);
        self.cache.insert(
            key.to_vec(),
            CacheEntry {
                value: value.clone(),
                dirty: false,
            },
        );
        value
    }

    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.cache.insert(
            key,
            CacheEntry {
                value: Some(value),
                dirty: true,
            },
        );
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.cache.insert(
            key.to_vec(),
            CacheEntry {
                value: None,
                dirty: true,
            },
        );
    }

    /// Returns true if the overlay read or wrote `key`.
    pub fn has(&self, key: &[u8]) -> bool {
        self.cache.contains_key(key)
    }

    /// Visits every touched key in key order as `(key, value, is_dirty)`.
    ///
    /// The visitor returns `false` to stop early.
    pub fn iterate_changes<F>(&self, mut visitor: F)
    where
        F: FnMut(&[u8], Option<&[u8]>, bool) -> bool,
    {
        for (key, entry) in &self.cache {
            if !visitor(key, entry.value.as_deref(), entry.dirty) {
                break;
            }
        }
    }

    /// Number of keys read or written.
    pub fn touched_len(&self) -> usize {
        self.cache.len()
    }

    /// Number of keys written or deleted.
    pub fn dirty_len(&self) -> usize {
        self.cache.values().filter(|entry| entry.dirty).count()
    }

    /// Drops buffered writes but keeps every touched key as a read.
    ///
    /// Used when the pre-checks reject a transaction: its writes must not land,
    /// but its result still depends on the keys it looked at.
    pub fn discard_writes(&mut self) {
        let parent = &self.parent;
        for (key, entry) in self.cache.iter_mut() {
            if entry.dirty {
                entry.value = parent.get(key);
                entry.dirty = false;
            }
        }
    }

    /// Commits every dirty entry into the parent and consumes the overlay.
    pub fn write(self) {
        for (key, entry) in self.cache {
            if !entry.dirty {
                continue;
            }
            match entry.value {
                Some(value) => self.parent.set(key, value),
                None => self.parent.delete(&key),
            }
        }
    }
}

impl fmt::Debug for ScratchStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScratchStore")
            .field("touched", &self.touched_len())
            .field("dirty", &self.dirty_len())
            .finish()
    }
}
