//! Sequential block executor.
//!
//! This is the baseline: every transaction is delivered against the latest
//! committed state and committed before the next one runs.

use parallel_deliver::{BlockCoordinator, DeliverError, FeeLedger, MemStore, FEE_COLLECTOR};
use std::sync::Arc;
use tracing::debug;

use super::{Executor, WorkloadResult};
use crate::{TransferApp, Workload};

/// Sequential executor that delivers transactions one at a time.
///
/// # Example
///
/// ```
/// use deliver_bench::{Executor, SequentialExecutor, Workload, WorkloadConfig};
///
/// let workload = Workload::generate(WorkloadConfig::default());
///
/// let executor = SequentialExecutor::new(true); // with signature verification
/// let (_, result) = executor.execute(&workload).unwrap();
///
/// println!("Successful: {}, Failed: {}", result.successful, result.failed);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SequentialExecutor {
    /// Whether to verify signatures during the ante step.
    pub verify_signatures: bool,
}

impl SequentialExecutor {
    pub fn new(verify_signatures: bool) -> Self {
        Self { verify_signatures }
    }
}

impl Executor for SequentialExecutor {
    fn execute(&self, workload: &Workload) -> Result<(Arc<MemStore>, WorkloadResult), DeliverError> {
        let store = workload.create_store();
        let app = TransferApp::new(self.verify_signatures, workload.config.chain_id);
        let coordinator = BlockCoordinator::new(
            Arc::new(app),
            store.clone(),
            Arc::new(FeeLedger::new()),
            FEE_COLLECTOR,
        );

        let mut result = WorkloadResult::default();
        for (height, block) in workload.raw_blocks().into_iter().enumerate() {
            coordinator.prepare(block)?;
            coordinator.run_serial()?;
            let log = coordinator.finalize()?;
            debug!(height, txs = log.entries.len(), "delivered block sequentially");
            result.record_block(&log);
        }

        Ok((store, result))
    }

    fn name(&self) -> &'static str {
        "sequential"
    }
}
