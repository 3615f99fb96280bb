//! Committed key-value state.

use alloy_primitives::{keccak256, B256};
use dashmap::DashMap;
use std::collections::BTreeMap;

/// Committed state a scratch overlay reads from and writes back into.
///
/// Implementations must tolerate concurrent readers while a single writer
/// commits an accepted overlay.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn set(&self, key: Vec<u8>, value: Vec<u8>);
    fn delete(&self, key: &[u8]);
}

/// In-memory committed state.
#[derive(Debug, Default)]
pub struct MemStore {
    data: DashMap<Vec<u8>, Vec<u8>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copies the whole state into an ordered map.
    pub fn snapshot(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.data
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Hash over all entries in key order.
    ///
    /// Two stores with the same root hold exactly the same state.
    pub fn state_root(&self) -> B256 {
        let mut buf = Vec::new();
        for (key, value) in self.snapshot() {
            buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
            buf.extend_from_slice(&key);
            buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
            buf.extend_from_slice(&value);
        }
        keccak256(&buf)
    }
}

impl StateStore for MemStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.get(key).map(|value| value.clone())
    }

    fn set(&self, key: Vec<u8>, value: Vec<u8>) {
        self.data.insert(key, value);
    }

    fn delete(&self, key: &[u8]) {
        self.data.remove(key);
    }
}
