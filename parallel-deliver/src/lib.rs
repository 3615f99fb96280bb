//! Speculative parallel transaction delivery for a key-value state machine.
//!
//! This crate executes the transactions of a block concurrently, each against
//! its own copy-on-write scratch overlay of committed state, and then accepts
//! or re-executes every result so that the committed state is identical to
//! what strictly sequential execution would have produced.
//!
//! # Core Components
//!
//! - **ScratchStore**: Copy-on-write overlay that tracks every key it touched
//! - **ConflictDetector**: Validates an overlay against the block's accumulated writes
//! - **FeeLedger**: Per-transaction fee and refund bookkeeping, settled once per block
//! - **ResultPipeline**: Bounded queue drained by a single long-lived consumer
//! - **BlockCoordinator**: Per-block metadata, preparation, execution and settlement
//! - **ParallelDeliver**: Worker pool plus an in-order commit sequencer
//!
//! # Algorithm Overview
//!
//! 1. `prepare` decodes the block, assigns indices and records fees
//! 2. Workers run every transaction speculatively against committed state
//! 3. Results flow through the bounded pipeline to the single drain consumer
//! 4. The consumer validates results in block order; any result that touched a
//!    key written earlier in the block is re-executed against fresh state
//! 5. Accepted writes are merged into the accumulator and committed
//! 6. `finalize` credits the net fees to the fee collector and resets the block
//!
//! # Example
//!
//! ```rust,ignore
//! use parallel_deliver::{MemStore, ParallelDeliver, PipelineConfig};
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemStore::new());
//! let deliver = ParallelDeliver::new(Arc::new(app), store, PipelineConfig::default())?;
//! let block = deliver.deliver_block(raw_txs)?;
//!
//! println!("reruns: {}", block.stats.reruns);
//! ```

pub mod accumulator;
pub mod conflict;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod fee;
pub mod pipeline;
pub mod scratch;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use accumulator::{AccumulatedWrite, BlockAccumulator};
pub use conflict::{ConflictDetector, ExemptAccountSet, FEE_COLLECTOR};
pub use coordinator::{BlockCoordinator, TxHandler};
pub use error::{BlockError, DeliverError, FeeError, PipelineError, TxError};
pub use executor::{BlockDelivery, BlockStats, ParallelDeliver, PipelineConfig};
pub use fee::{FeeLedger, NetFees};
pub use pipeline::{ResultPipeline, ResultSender, DEFAULT_QUEUE_CAPACITY};
pub use scratch::ScratchStore;
pub use store::{MemStore, StateStore};
pub use types::{
    account_key, tx_key, Coins, ACCOUNT_KEY_PREFIX, DeliverOutcome, EvmIndex, Event, ExecMode, ExecutionLog,
    ExecutionResult, LogEntry, TxContext, TxIndex, TxResponse, TxStatus,
};
