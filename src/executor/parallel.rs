//! Parallel block executor backed by [`ParallelDeliver`].

use parallel_deliver::{DeliverError, MemStore, ParallelDeliver, PipelineConfig};
use std::sync::Arc;

use super::{Executor, WorkloadResult};
use crate::{TransferApp, Workload};

/// Delivers each block speculatively on a worker pool with in-order commit.
#[derive(Debug, Clone)]
pub struct ParallelExecutor {
    /// Whether to verify signatures during the ante step.
    pub verify_signatures: bool,
    pub config: PipelineConfig,
}

impl ParallelExecutor {
    pub fn new(verify_signatures: bool, num_threads: usize) -> Self {
        Self {
            verify_signatures,
            config: PipelineConfig {
                num_threads,
                ..Default::default()
            },
        }
    }
}

impl Executor for ParallelExecutor {
    fn execute(&self, workload: &Workload) -> Result<(Arc<MemStore>, WorkloadResult), DeliverError> {
        let collector = self.config.fee_collector;
        let store = workload.create_store_with_collector(collector);
        let app = TransferApp::new(self.verify_signatures, workload.config.chain_id)
            .with_fee_collector(collector);
        let deliver = ParallelDeliver::new(Arc::new(app), store.clone(), self.config.clone())?;

        let mut result = WorkloadResult::default();
        for block in workload.raw_blocks() {
            let delivery = deliver.deliver_block(block)?;
            result.reruns += delivery.stats.reruns;
            result.record_block(&delivery.log);
        }
        deliver.shutdown()?;

        Ok((store, result))
    }

    fn name(&self) -> &'static str {
        "parallel"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{decode_account, SequentialExecutor, WorkloadConfig};
    use alloy_primitives::{address, U256};
    use parallel_deliver::{account_key, StateStore, FEE_COLLECTOR};

    fn compare(config: WorkloadConfig, num_threads: usize) -> WorkloadResult {
        let workload = Workload::generate(config);

        let (seq_store, seq) = SequentialExecutor::new(true).execute(&workload).unwrap();
        let (par_store, par) = ParallelExecutor::new(true, num_threads)
            .execute(&workload)
            .unwrap();

        assert_eq!(par_store.snapshot(), seq_store.snapshot());
        assert_eq!(par_store.state_root(), seq_store.state_root());
        assert_eq!(par.successful, seq.successful);
        assert_eq!(par.failed, seq.failed);
        assert_eq!(par.fees, seq.fees);
        par
    }

    #[test]
    fn test_matches_sequential_without_conflicts() {
        compare(
            WorkloadConfig {
                num_accounts: 200,
                num_transactions: 60,
                transactions_per_block: 20,
                ..Default::default()
            },
            4,
        );
    }

    #[test]
    fn test_matches_sequential_under_full_conflict() {
        let result = compare(
            WorkloadConfig {
                num_accounts: 20,
                num_transactions: 60,
                transactions_per_block: 30,
                conflict_factor: 1.0,
                ..Default::default()
            },
            4,
        );

        // Only two hot accounts: every transfer after the first in a block
        // touches an account written before it.
        assert_eq!(result.reruns, 58);
    }

    #[test]
    fn test_matches_sequential_with_ante_failures() {
        compare(
            WorkloadConfig {
                num_accounts: 8,
                num_transactions: 50,
                transactions_per_block: 25,
                conflict_factor: 0.5,
                invalid_ratio: 0.3,
                evm_ratio: 0.7,
                seed: 7,
                ..Default::default()
            },
            3,
        );
    }

    #[test]
    fn test_configured_fee_collector_is_credited() {
        let collector = address!("00000000000000000000000000000000000000fe");
        let workload = Workload::generate(WorkloadConfig {
            num_accounts: 30,
            num_transactions: 40,
            transactions_per_block: 20,
            conflict_factor: 0.5,
            ..Default::default()
        });
        let executor = ParallelExecutor {
            verify_signatures: true,
            config: PipelineConfig {
                num_threads: 4,
                fee_collector: collector,
                exempt_accounts: vec![collector],
                ..Default::default()
            },
        };

        let (store, result) = executor.execute(&workload).unwrap();

        assert_eq!(result.total(), 40);
        let balance = store
            .get(&account_key(&collector))
            .and_then(|raw| decode_account(&raw))
            .map(|info| info.balance);
        assert_eq!(balance, Some(result.fees));
        assert!(result.fees > U256::ZERO);
        assert_eq!(store.get(&account_key(&FEE_COLLECTOR)), None);
    }
}
