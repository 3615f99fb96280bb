//! Commit-time conflict detection against the block accumulator.
//!
//! A speculative result is stale if it read or wrote any key that a
//! transaction accepted earlier in the same block has written. Keys of exempt
//! accounts (the fee collector) are written by nearly every transaction and
//! are skipped, otherwise every transaction after the first would conflict.

use crate::accumulator::BlockAccumulator;
use crate::types::{account_key, ExecutionResult};
use alloy_primitives::{address, Address};
use std::collections::HashSet;
use tracing::trace;

/// The protocol fee-collector account.
pub const FEE_COLLECTOR: Address = address!("f1829676db577682e944fc3493d451b67ff3e29f");

/// Accounts whose state keys never trigger a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExemptAccountSet {
    keys: HashSet<Vec<u8>>,
}

impl ExemptAccountSet {
    pub fn new(accounts: impl IntoIterator<Item = Address>) -> Self {
        Self {
            keys: accounts.into_iter().map(|addr| account_key(&addr)).collect(),
        }
    }

    /// An empty set: every shared key conflicts.
    pub fn none() -> Self {
        Self {
            keys: HashSet::new(),
        }
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.keys.contains(key)
    }

    pub fn contains(&self, account: &Address) -> bool {
        self.contains_key(&account_key(account))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Default for ExemptAccountSet {
    fn default() -> Self {
        Self::new([FEE_COLLECTOR])
    }
}

/// Decides whether a speculative result may be accepted.
#[derive(Debug, Clone, Default)]
pub struct ConflictDetector {
    exempt: ExemptAccountSet,
}

impl ConflictDetector {
    pub fn new(exempt: ExemptAccountSet) -> Self {
        Self { exempt }
    }

    pub fn exempt(&self) -> &ExemptAccountSet {
        &self.exempt
    }

    /// Returns true if `result` must be discarded and re-executed.
    ///
    /// A result without a scratch overlay always conflicts.
    pub fn conflict(&self, result: &ExecutionResult, accumulator: &BlockAccumulator) -> bool {
        let Some(scratch) = &result.scratch else {
            return true;
        };
        let mut conflict = false;
        scratch.iterate_changes(|key, _, _| {
            if accumulator.contains(key) && !self.exempt.contains_key(key) {
                trace!(
                    tx = result.sequence,
                    writer = accumulator.get(key).map(|w| w.tx_index),
                    "stale key"
                );
                conflict = true;
                return false;
            }
            true
        });
        conflict
    }

    /// Copies every dirty pair of an accepted result into the accumulator.
    ///
    /// Only the single commit consumer may call this, and only after
    /// [`ConflictDetector::conflict`] returned false for the result.
    pub fn collect(&self, result: &ExecutionResult, accumulator: &mut BlockAccumulator) {
        let Some(scratch) = &result.scratch else {
            return;
        };
        scratch.iterate_changes(|key, value, dirty| {
            if dirty {
                accumulator.record(key.to_vec(), value.map(<[u8]>::to_vec), result.sequence);
            }
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scratch::ScratchStore;
    use crate::store::{MemStore, StateStore};
    use crate::types::TxResponse;
    use std::sync::Arc;

    fn result_with(
        store: &Arc<MemStore>,
        sequence: u32,
        build: impl FnOnce(&mut ScratchStore),
    ) -> ExecutionResult {
        let mut scratch = ScratchStore::new(store.clone());
        build(&mut scratch);
        ExecutionResult::new(sequence, TxResponse::default(), Some(scratch), None)
    }

    fn accept(detector: &ConflictDetector, acc: &mut BlockAccumulator, mut result: ExecutionResult) {
        assert!(!detector.conflict(&result, acc));
        detector.collect(&result, acc);
        result.commit();
    }

    #[test]
    fn test_missing_scratch_conflicts() {
        let detector = ConflictDetector::default();
        let acc = BlockAccumulator::new();

        assert!(detector.conflict(&ExecutionResult::missing(0), &acc));
    }

    #[test]
    fn test_write_write_collision_conflicts() {
        let store = Arc::new(MemStore::new());
        let detector = ConflictDetector::default();
        let mut acc = BlockAccumulator::new();

        accept(&detector, &mut acc, result_with(&store, 0, |s| s.set(b"k".to_vec(), b"0".to_vec())));

        let later = result_with(&store, 1, |s| s.set(b"k".to_vec(), b"1".to_vec()));
        assert!(detector.conflict(&later, &acc));
    }

    #[test]
    fn test_stale_read_conflicts() {
        let store = Arc::new(MemStore::new());
        let detector = ConflictDetector::default();
        let mut acc = BlockAccumulator::new();

        // Executed before tx0 committed, so it read the old value.
        let reader = result_with(&store, 1, |s| {
            s.get(b"k");
        });
        accept(&detector, &mut acc, result_with(&store, 0, |s| s.set(b"k".to_vec(), b"0".to_vec())));

        assert!(detector.conflict(&reader, &acc));
    }

    #[test]
    fn test_disjoint_keys_do_not_conflict() {
        let store = Arc::new(MemStore::new());
        let detector = ConflictDetector::default();
        let mut acc = BlockAccumulator::new();

        accept(&detector, &mut acc, result_with(&store, 0, |s| s.set(b"a".to_vec(), b"0".to_vec())));

        let other = result_with(&store, 1, |s| {
            s.get(b"b");
            s.set(b"c".to_vec(), b"1".to_vec());
        });
        assert!(!detector.conflict(&other, &acc));
    }

    #[test]
    fn test_exempt_key_never_conflicts() {
        let store = Arc::new(MemStore::new());
        let detector = ConflictDetector::default();
        let mut acc = BlockAccumulator::new();
        let collector = account_key(&FEE_COLLECTOR);

        for sequence in 0..5 {
            let value = vec![sequence as u8];
            let key = collector.clone();
            let result = result_with(&store, sequence, move |s| {
                s.get(&key);
                s.set(key.clone(), value);
            });
            accept(&detector, &mut acc, result);
        }

        assert_eq!(acc.get(&collector).map(|w| w.tx_index), Some(4));
    }

    #[test]
    fn test_empty_exempt_set_makes_collector_conflict() {
        let store = Arc::new(MemStore::new());
        let detector = ConflictDetector::new(ExemptAccountSet::none());
        let mut acc = BlockAccumulator::new();
        let collector = account_key(&FEE_COLLECTOR);

        let key = collector.clone();
        accept(&detector, &mut acc, result_with(&store, 0, move |s| s.set(key, vec![0])));

        let second = result_with(&store, 1, |s| s.set(collector, vec![1]));
        assert!(detector.conflict(&second, &acc));
    }

    #[test]
    fn test_collect_skips_reads_and_keeps_deletes() {
        let store = Arc::new(MemStore::new());
        store.set(b"gone".to_vec(), b"x".to_vec());
        let detector = ConflictDetector::default();
        let mut acc = BlockAccumulator::new();

        let result = result_with(&store, 2, |s| {
            s.get(b"read-only");
            s.delete(b"gone");
        });
        detector.collect(&result, &mut acc);

        assert!(!acc.contains(b"read-only"));
        assert_eq!(acc.get(b"gone").map(|w| w.value.clone()), Some(None));
    }

    #[test]
    fn test_three_transaction_block_scenario() {
        let store = Arc::new(MemStore::new());
        let detector = ConflictDetector::default();
        let mut acc = BlockAccumulator::new();
        let exempt = account_key(&FEE_COLLECTOR);

        // tx0 writes "a" and is accepted.
        accept(&detector, &mut acc, result_with(&store, 0, |s| s.set(b"a".to_vec(), b"v0".to_vec())));

        // tx1 writes "a" and "b" and collides on "a".
        let tx1 = result_with(&store, 1, |s| {
            s.set(b"a".to_vec(), b"v1".to_vec());
            s.set(b"b".to_vec(), b"v1".to_vec());
        });
        assert!(detector.conflict(&tx1, &acc));

        // Re-executed, tx1 only writes "b".
        accept(&detector, &mut acc, result_with(&store, 1, |s| s.set(b"b".to_vec(), b"v1'".to_vec())));

        // tx2 only writes the exempt fee-collector key.
        let key = exempt.clone();
        accept(&detector, &mut acc, result_with(&store, 2, move |s| s.set(key, b"v2".to_vec())));

        assert_eq!(acc.len(), 3);
        assert_eq!(acc.get(b"a").and_then(|w| w.value.clone()), Some(b"v0".to_vec()));
        assert_eq!(acc.get(b"b").and_then(|w| w.value.clone()), Some(b"v1'".to_vec()));
        assert_eq!(acc.get(&exempt).and_then(|w| w.value.clone()), Some(b"v2".to_vec()));
        assert_eq!(store.get(b"a"), Some(b"v0".to_vec()));
    }
}
