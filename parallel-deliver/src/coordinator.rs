//! Per-block metadata, transaction delegation and end-of-block settlement.

use crate::error::{BlockError, TxError};
use crate::fee::FeeLedger;
use crate::scratch::ScratchStore;
use crate::store::StateStore;
use crate::types::{
    tx_key, Coins, DeliverOutcome, EvmIndex, ExecMode, ExecutionLog, ExecutionResult, LogEntry,
    TxContext, TxIndex, TxStatus,
};
use alloy_primitives::{Address, Bytes};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The application side of delivery: decoding, fees and execution.
///
/// Implementations must be deterministic: the same transaction run against
/// the same state must produce the same writes.
pub trait TxHandler: Send + Sync {
    type Tx: Send + Sync;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Decodes raw transaction bytes.
    fn decode(&self, raw: &[u8]) -> Result<Self::Tx, Self::Error>;

    /// Fee prepaid by the transaction.
    fn fee(&self, tx: &Self::Tx) -> Coins;

    /// Whether the transaction is EVM-compatible.
    fn is_evm(&self, tx: &Self::Tx) -> bool;

    /// Executes the transaction against `scratch`.
    ///
    /// When the pre-checks fail the outcome carries [`TxError::Ante`]; any
    /// writes the handler made are then discarded by the caller.
    fn deliver(&self, tx: &Self::Tx, ctx: &TxContext, scratch: &mut ScratchStore) -> DeliverOutcome;

    /// Adds `amount` to the balance of `collector`.
    fn credit_fee_collector(
        &self,
        scratch: &mut ScratchStore,
        collector: Address,
        amount: &Coins,
    ) -> Result<(), TxError>;
}

struct PreparedTx<T> {
    raw: Bytes,
    key: Vec<u8>,
    tx: Arc<T>,
    status: TxStatus,
    recorded: bool,
}

struct BlockMeta<T> {
    txs: Vec<PreparedTx<T>>,
    open: bool,
}

impl<T> Default for BlockMeta<T> {
    fn default() -> Self {
        Self {
            txs: Vec::new(),
            open: false,
        }
    }
}

/// Owns all per-block state.
///
/// Lifecycle per block: [`prepare`](Self::prepare), any number of
/// [`run_one`](Self::run_one) / [`record_outcome`](Self::record_outcome)
/// calls, then exactly one [`finalize`](Self::finalize).
pub struct BlockCoordinator<H: TxHandler> {
    handler: Arc<H>,
    store: Arc<dyn StateStore>,
    fee_ledger: Arc<FeeLedger>,
    fee_collector: Address,
    block: RwLock<BlockMeta<H::Tx>>,
}

impl<H: TxHandler> BlockCoordinator<H> {
    pub fn new(
        handler: Arc<H>,
        store: Arc<dyn StateStore>,
        fee_ledger: Arc<FeeLedger>,
        fee_collector: Address,
    ) -> Self {
        Self {
            handler,
            store,
            fee_ledger,
            fee_collector,
            block: RwLock::new(BlockMeta::default()),
        }
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn fee_ledger(&self) -> &FeeLedger {
        &self.fee_ledger
    }

    pub fn fee_collector(&self) -> Address {
        self.fee_collector
    }

    /// Decodes the block and builds its metadata.
    ///
    /// Assigns `index_in_block` in input order, records every fee and gives
    /// EVM transactions a dense `evm_index`. If any transaction fails to
    /// decode, nothing is recorded and the error names its index.
    pub fn prepare(&self, raw_txs: Vec<Bytes>) -> Result<(), BlockError> {
        let mut block = self.block.write();
        if block.open {
            return Err(BlockError::BlockInProgress(block.txs.len()));
        }

        let mut txs = Vec::with_capacity(raw_txs.len());
        let mut fees = Vec::with_capacity(raw_txs.len());
        let mut next_evm_index: EvmIndex = 0;
        for (index, raw) in raw_txs.into_iter().enumerate() {
            let index = index as TxIndex;
            let tx = self.handler.decode(&raw).map_err(|e| BlockError::Decode {
                index,
                source: Box::new(e),
            })?;
            let is_evm = self.handler.is_evm(&tx);
            let evm_index = is_evm.then(|| {
                let evm_index = next_evm_index;
                next_evm_index += 1;
                evm_index
            });
            let key = tx_key(&raw, index);
            fees.push((key.clone(), self.handler.fee(&tx)));
            txs.push(PreparedTx {
                raw,
                key,
                tx: Arc::new(tx),
                status: TxStatus {
                    index_in_block: index,
                    is_evm,
                    evm_index,
                    ..Default::default()
                },
                recorded: false,
            });
        }

        for (key, fee) in fees {
            self.fee_ledger.set_fee(key, fee);
        }
        debug!(txs = txs.len(), evm_txs = next_evm_index, "prepared block");
        block.txs = txs;
        block.open = true;
        Ok(())
    }

    /// Number of transactions in the current block.
    pub fn tx_count(&self) -> usize {
        self.block.read().txs.len()
    }

    pub fn is_open(&self) -> bool {
        self.block.read().open
    }

    pub fn status(&self, index: TxIndex) -> Option<TxStatus> {
        self.block
            .read()
            .txs
            .get(index as usize)
            .map(|prepared| prepared.status.clone())
    }

    pub fn statuses(&self) -> Vec<TxStatus> {
        self.block
            .read()
            .txs
            .iter()
            .map(|prepared| prepared.status.clone())
            .collect()
    }

    pub fn raw_tx(&self, index: TxIndex) -> Option<Bytes> {
        self.block
            .read()
            .txs
            .get(index as usize)
            .map(|prepared| prepared.raw.clone())
    }

    /// Executes one transaction on a fresh overlay over committed state.
    ///
    /// The block lock is not held while the handler runs.
    pub fn run_one(&self, index: TxIndex, mode: ExecMode) -> Result<ExecutionResult, BlockError> {
        let (tx, key, ctx) = {
            let block = self.block.read();
            let prepared = block
                .txs
                .get(index as usize)
                .ok_or(BlockError::UnknownTx(index))?;
            let ctx = TxContext {
                index_in_block: index,
                evm_index: prepared.status.evm_index,
                mode,
            };
            (prepared.tx.clone(), prepared.key.clone(), ctx)
        };

        let mut scratch = ScratchStore::new(self.store.clone());
        let outcome = self.handler.deliver(&tx, &ctx, &mut scratch);

        let ante_failed = matches!(outcome.error, Some(TxError::Ante(_)));
        if ante_failed {
            scratch.discard_writes();
        } else {
            self.fee_ledger
                .set_refund(&key, outcome.refund.unwrap_or_default())?;
        }

        let mut result = ExecutionResult::new(index, outcome.response, Some(scratch), outcome.error);
        result.evm_index = ctx.evm_index;
        Ok(result)
    }

    /// Records the accepted result of a transaction in the status table.
    pub fn record_outcome(&self, result: &ExecutionResult, rerun: bool) -> Result<(), BlockError> {
        let mut block = self.block.write();
        let prepared = block
            .txs
            .get_mut(result.sequence as usize)
            .ok_or(BlockError::UnknownTx(result.sequence))?;
        let status = &mut prepared.status;
        status.ante_error = None;
        status.deliver_error = None;
        match &result.error {
            Some(TxError::Ante(msg)) => status.ante_error = Some(msg.clone()),
            Some(TxError::Execution(msg)) => status.deliver_error = Some(msg.clone()),
            None => {}
        }
        status.rerun = rerun;
        status.gas_used = result.response.gas_used;
        prepared.recorded = true;
        Ok(())
    }

    /// Runs the whole block serially, committing each result immediately.
    pub fn run_serial(&self) -> Result<Vec<ExecutionResult>, BlockError> {
        let count = self.tx_count() as TxIndex;
        let mut results = Vec::with_capacity(count as usize);
        for index in 0..count {
            let mut result = self.run_one(index, ExecMode::Deliver)?;
            self.record_outcome(&result, false)?;
            result.commit();
            results.push(result);
        }
        Ok(results)
    }

    /// Drops the current block without settling it.
    pub fn abort(&self) {
        let mut block = self.block.write();
        if block.open {
            warn!(txs = block.txs.len(), "aborting block");
        }
        *block = BlockMeta::default();
        self.fee_ledger.clear();
    }

    /// Settles fees, produces the execution log and resets all block state.
    ///
    /// The net fee `Σ fee − Σ refund` over transactions without an ante error
    /// is credited to the fee collector in one isolated overlay that is then
    /// committed.
    pub fn finalize(&self) -> Result<ExecutionLog, BlockError> {
        let mut block = self.block.write();
        if !block.open {
            return Err(BlockError::NoBlock);
        }
        let total = block.txs.len();
        let recorded = block.txs.iter().filter(|prepared| prepared.recorded).count();
        if recorded != total {
            return Err(BlockError::Incomplete { recorded, total });
        }

        let finished = std::mem::take(&mut *block);
        let net = self.fee_ledger.net_fees(
            finished
                .txs
                .iter()
                .filter(|prepared| prepared.status.ante_error.is_none())
                .map(|prepared| prepared.key.as_slice()),
        );
        if net.clamped > 0 {
            warn!(clamped = net.clamped, "refunds exceeded fees in block");
        }
        self.fee_ledger.clear();

        let mut overlay = ScratchStore::new(self.store.clone());
        self.handler
            .credit_fee_collector(&mut overlay, self.fee_collector, &net.total)
            .map_err(BlockError::Credit)?;
        overlay.write();

        let entries: Vec<LogEntry> = finished
            .txs
            .into_iter()
            .map(|prepared| LogEntry {
                error: prepared.status.error_message(),
                evm_index: prepared.status.evm_index,
                gas_used: prepared.status.gas_used,
                tx: prepared.raw,
            })
            .collect();
        info!(txs = entries.len(), fee = %net.total, "finalized block");

        Ok(ExecutionLog {
            entries,
            fee_collected: net.total,
        })
    }
}
