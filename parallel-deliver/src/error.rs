//! Error types for block delivery.

use crate::types::TxIndex;
use thiserror::Error;

/// Per-transaction failure reported by the execution contract.
///
/// These never abort the block; they are recorded in the execution log.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxError {
    /// Fee or validity pre-check failed. The transaction pays no fee.
    #[error("ante check failed: {0}")]
    Ante(String),
    /// The transaction passed its pre-checks but failed while executing.
    #[error("execution failed: {0}")]
    Execution(String),
}

/// Errors raised by the block lifecycle.
#[derive(Debug, Error)]
pub enum BlockError {
    /// `prepare` was called before the previous block was finalized.
    #[error("block already in progress with {0} transactions")]
    BlockInProgress(usize),
    /// `finalize` was called without a prepared block.
    #[error("no block in progress")]
    NoBlock,
    /// A raw transaction could not be decoded. Nothing of the block was kept.
    #[error("failed to decode transaction {index}: {source}")]
    Decode {
        index: TxIndex,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// The index does not name a transaction of the current block.
    #[error("unknown transaction index {0}")]
    UnknownTx(TxIndex),
    /// `finalize` was called before every transaction had an accepted result.
    #[error("block incomplete: {recorded} of {total} transactions recorded")]
    Incomplete { recorded: usize, total: usize },
    /// Crediting the fee collector failed.
    #[error("fee collector credit failed: {0}")]
    Credit(#[source] TxError),
    #[error(transparent)]
    Fee(#[from] FeeError),
    /// The block was dropped by the commit sequencer before all of its
    /// results arrived.
    #[error("block abandoned before all results arrived")]
    Abandoned,
}

/// Errors raised by the fee ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeeError {
    /// A refund was recorded for a transaction that never had a fee.
    #[error("refund recorded for a transaction without a fee")]
    RefundWithoutFee,
}

/// Errors raised by the result pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The queue is closed: the pipeline was shut down or its consumer exited.
    #[error("result pipeline is closed")]
    Closed,
    /// The consumer thread panicked while handling a result.
    #[error("result consumer panicked")]
    ConsumerPanicked,
    /// An execution worker panicked. The block was abandoned.
    #[error("execution worker panicked")]
    WorkerPanicked,
    /// An earlier block failed after its transactions started committing.
    /// The instance refuses further blocks.
    #[error("parallel delivery is poisoned by an earlier failed block")]
    Poisoned,
    #[error("failed to spawn result consumer: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Errors raised while delivering a whole block.
#[derive(Debug, Error)]
pub enum DeliverError {
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}
