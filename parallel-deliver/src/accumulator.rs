//! Keys written by the transactions already accepted in the current block.

use crate::types::TxIndex;
use std::collections::HashMap;

/// The latest accepted write of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccumulatedWrite {
    /// `None` records a deletion.
    pub value: Option<Vec<u8>>,
    pub tx_index: TxIndex,
}

/// Append-only (within a block) record of accepted writes.
///
/// This is the conflict-detection baseline: any later transaction that touched
/// one of these keys ran against a stale view. It is owned by the single
/// commit consumer and is never shared, so it carries no lock.
#[derive(Debug, Clone, Default)]
pub struct BlockAccumulator {
    items: HashMap<Vec<u8>, AccumulatedWrite>,
}

impl BlockAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.items.contains_key(key)
    }

    pub fn get(&self, key: &[u8]) -> Option<&AccumulatedWrite> {
        self.items.get(key)
    }

    /// Records the write of `key` by transaction `tx_index`, replacing any earlier one.
    pub fn record(&mut self, key: Vec<u8>, value: Option<Vec<u8>>, tx_index: TxIndex) {
        self.items.insert(key, AccumulatedWrite { value, tx_index });
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &AccumulatedWrite)> {
        self.items.iter().map(|(key, write)| (key.as_slice(), write))
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}
