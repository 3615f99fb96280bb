//! Per-transaction fee and refund bookkeeping.

use crate::error::FeeError;
use crate::types::Coins;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Default)]
struct FeeMaps {
    fee: HashMap<Vec<u8>, Coins>,
    refund: HashMap<Vec<u8>, Coins>,
}

/// Result of summing fees for settlement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetFees {
    pub total: Coins,
    /// Transactions whose refund exceeded their fee and was clamped.
    pub clamped: usize,
}

/// Fee and refund maps keyed by transaction key (see [`crate::tx_key`]).
///
/// A single lock covers both maps so that a fee and the refund of the same
/// transaction are never observed half-updated.
#[derive(Debug, Default)]
pub struct FeeLedger {
    inner: RwLock<FeeMaps>,
}

impl FeeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fee(&self, tx: Vec<u8>, fee: Coins) {
        self.inner.write().fee.insert(tx, fee);
    }

    /// Records the refund of a transaction, replacing an earlier one.
    ///
    /// Fails if the transaction has no fee.
    pub fn set_refund(&self, tx: &[u8], refund: Coins) -> Result<(), FeeError> {
        let mut maps = self.inner.write();
        if !maps.fee.contains_key(tx) {
            return Err(FeeError::RefundWithoutFee);
        }
        maps.refund.insert(tx.to_vec(), refund);
        Ok(())
    }

    pub fn fee(&self, tx: &[u8]) -> Option<Coins> {
        self.inner.read().fee.get(tx).cloned()
    }

    pub fn refund(&self, tx: &[u8]) -> Option<Coins> {
        self.inner.read().refund.get(tx).cloned()
    }

    /// Copy of the fee map. Later writes or a `clear` do not affect it.
    pub fn fee_snapshot(&self) -> HashMap<Vec<u8>, Coins> {
        self.inner.read().fee.clone()
    }

    /// Copy of the refund map. Later writes or a `clear` do not affect it.
    pub fn refund_snapshot(&self) -> HashMap<Vec<u8>, Coins> {
        self.inner.read().refund.clone()
    }

    /// Sums `fee - refund` over `txs` under one read lock.
    ///
    /// A refund larger than its fee is clamped so that a transaction never
    /// contributes a negative amount.
    pub fn net_fees<'a>(&self, txs: impl IntoIterator<Item = &'a [u8]>) -> NetFees {
        let maps = self.inner.read();
        let mut net = NetFees::default();
        for tx in txs {
            let Some(fee) = maps.fee.get(tx) else {
                continue;
            };
            let contribution = match maps.refund.get(tx) {
                Some(refund) => {
                    let (diff, clamped) = fee.saturating_sub(refund);
                    if clamped {
                        warn!(%fee, %refund, "refund exceeds fee, clamping");
                        net.clamped += 1;
                    }
                    diff
                }
                None => fee.clone(),
            };
            net.total.add(&contribution);
        }
        net
    }

    pub fn len(&self) -> usize {
        self.inner.read().fee.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties both maps atomically.
    pub fn clear(&self) {
        let mut maps = self.inner.write();
        *maps = FeeMaps::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;
    use std::sync::Arc;
    use std::thread;

    fn wei(amount: u64) -> Coins {
        Coins::from_coin("wei", U256::from(amount))
    }

    #[test]
    fn test_refund_requires_fee() {
        let ledger = FeeLedger::new();

        assert_eq!(ledger.set_refund(b"tx", wei(1)), Err(FeeError::RefundWithoutFee));

        ledger.set_fee(b"tx".to_vec(), wei(10));
        assert!(ledger.set_refund(b"tx", wei(1)).is_ok());
        assert_eq!(ledger.refund(b"tx"), Some(wei(1)));
    }

    #[test]
    fn test_net_fees_excludes_unlisted_and_clamps() {
        let ledger = FeeLedger::new();
        ledger.set_fee(b"a".to_vec(), wei(10));
        ledger.set_fee(b"b".to_vec(), wei(20));
        ledger.set_fee(b"c".to_vec(), wei(5));
        ledger.set_refund(b"a", wei(3)).unwrap();
        ledger.set_refund(b"c", wei(9)).unwrap();

        let net = ledger.net_fees([b"a".as_slice(), b"c".as_slice()]);
        assert_eq!(net.total, wei(7));
        assert_eq!(net.clamped, 1);

        let net = ledger.net_fees([b"a".as_slice(), b"b".as_slice()]);
        assert_eq!(net.total, wei(27));
        assert_eq!(net.clamped, 0);
    }

    #[test]
    fn test_snapshots_survive_clear() {
        let ledger = FeeLedger::new();
        ledger.set_fee(b"a".to_vec(), wei(10));
        ledger.set_refund(b"a", wei(2)).unwrap();

        let fees = ledger.fee_snapshot();
        let refunds = ledger.refund_snapshot();
        ledger.clear();

        assert!(ledger.is_empty());
        assert!(ledger.refund_snapshot().is_empty());
        assert_eq!(fees.get(b"a".as_slice()), Some(&wei(10)));
        assert_eq!(refunds.get(b"a".as_slice()), Some(&wei(2)));
    }

    #[test]
    fn test_concurrent_writers() {
        let ledger = Arc::new(FeeLedger::new());
        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let ledger = ledger.clone();
                thread::spawn(move || {
                    let key = i.to_be_bytes().to_vec();
                    ledger.set_fee(key.clone(), wei(10));
                    ledger.set_refund(&key, wei(i)).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let keys: Vec<Vec<u8>> = (0..8u64).map(|i| i.to_be_bytes().to_vec()).collect();
        let net = ledger.net_fees(keys.iter().map(Vec::as_slice));
        // 8 * 10 - (0 + 1 + ... + 7)
        assert_eq!(net.total, wei(80 - 28));
    }
}
