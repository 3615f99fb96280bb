//! Block delivery strategies.
//!
//! This module provides the [`Executor`] trait and the two strategies the
//! harness compares: plain sequential delivery and speculative parallel
//! delivery. Both run the same [`TransferApp`](crate::TransferApp), so the
//! state they produce must be identical.

mod parallel;
mod sequential;

pub use parallel::ParallelExecutor;
pub use sequential::SequentialExecutor;

use crate::{Workload, DENOM};
use alloy_primitives::U256;
use parallel_deliver::{DeliverError, ExecutionLog, MemStore};
use std::sync::Arc;

/// Result of delivering a workload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadResult {
    /// Number of transactions delivered without error.
    pub successful: usize,
    /// Number of failed transactions (ante or execution error).
    pub failed: usize,
    /// Transactions re-executed after a conflict.
    pub reruns: usize,
    pub blocks: usize,
    /// Net fees credited to the fee collector.
    pub fees: U256,
}

impl WorkloadResult {
    /// Adds the execution log of one block.
    pub fn record_block(&mut self, log: &ExecutionLog) {
        self.successful += log.successful();
        self.failed += log.failed();
        self.fees += log.fee_collected.amount_of(DENOM);
        self.blocks += 1;
    }

    /// Total number of transactions processed.
    pub fn total(&self) -> usize {
        self.successful + self.failed
    }
}

/// Trait for different block delivery strategies.
///
/// # Implementing a New Executor
///
/// ```ignore
/// use deliver_bench::executor::{Executor, WorkloadResult};
/// use deliver_bench::Workload;
/// use parallel_deliver::{DeliverError, MemStore};
/// use std::sync::Arc;
///
/// pub struct BatchedExecutor {
///     pub batch_size: usize,
/// }
///
/// impl Executor for BatchedExecutor {
///     fn execute(&self, workload: &Workload) -> Result<(Arc<MemStore>, WorkloadResult), DeliverError> {
///         // Your implementation here
///         todo!()
///     }
///
///     fn name(&self) -> &'static str {
///         "batched"
///     }
/// }
/// ```
pub trait Executor {
    /// Delivers every block of the workload against a fresh store.
    ///
    /// # Returns
    /// A tuple of (final committed store, delivery counters).
    fn execute(&self, workload: &Workload) -> Result<(Arc<MemStore>, WorkloadResult), DeliverError>;

    /// Returns a human-readable name for this executor.
    fn name(&self) -> &'static str {
        "unknown"
    }
}
