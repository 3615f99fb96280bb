//! Parallel block delivery with in-order optimistic commit.
//!
//! # Algorithm Overview
//!
//! Every transaction of a block runs once on a worker against a private
//! overlay of committed state. Results are pushed into the long-lived
//! [`ResultPipeline`], whose single consumer is the commit sequencer:
//!
//! 1. Results arriving out of order are buffered until every lower index has
//!    been committed
//! 2. The next-in-order result is checked against the block accumulator
//! 3. A clean result is merged into the accumulator and committed
//! 4. A stale result is dropped and the transaction is re-executed serially
//!    against the now-current state; that result is committed without a
//!    second check since nothing can commit concurrently with it
//!
//! Because commits happen strictly in block order and every committed result
//! observed only state produced by lower indices, the final state equals
//! that of sequential delivery.

use crate::accumulator::BlockAccumulator;
use crate::conflict::{ConflictDetector, ExemptAccountSet, FEE_COLLECTOR};
use crate::coordinator::{BlockCoordinator, TxHandler};
use crate::error::{BlockError, DeliverError, PipelineError};
use crate::fee::FeeLedger;
use crate::pipeline::{ResultPipeline, DEFAULT_QUEUE_CAPACITY};
use crate::store::StateStore;
use crate::types::{ExecMode, ExecutionLog, ExecutionResult, TxIndex, TxResponse};
use alloy_primitives::{Address, Bytes};
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Configuration for parallel delivery.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of execution workers.
    pub num_threads: usize,
    /// Capacity of the result queue.
    pub queue_capacity: usize,
    /// Account credited with the net fees of each block.
    pub fee_collector: Address,
    /// Accounts whose keys never cause a conflict.
    pub exempt_accounts: Vec<Address>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            num_threads: thread::available_parallelism().map_or(4, |n| n.get()),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            fee_collector: FEE_COLLECTOR,
            exempt_accounts: vec![FEE_COLLECTOR],
        }
    }
}

/// Counters for one delivered block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockStats {
    pub txs: usize,
    /// Transactions whose speculative result was accepted.
    pub parallel: usize,
    /// Transactions re-executed after a conflict.
    pub reruns: usize,
    pub duration: Duration,
}

/// Everything produced by delivering one block.
#[derive(Debug)]
pub struct BlockDelivery {
    pub log: ExecutionLog,
    /// Responses in block order.
    pub responses: Vec<TxResponse>,
    /// Writes accepted during the block, fee settlement excluded.
    pub accumulator: BlockAccumulator,
    pub stats: BlockStats,
}

// ============================================================================
// Commit sequencer
// ============================================================================

struct SequencedBlock {
    responses: Vec<TxResponse>,
    accumulator: BlockAccumulator,
    reruns: usize,
}

/// Item flowing through the result pipeline. Every item carries the height of
/// the block it belongs to.
enum BlockItem {
    Result {
        height: u64,
        total: usize,
        result: ExecutionResult,
    },
    /// Sent after a worker failure: drop whatever arrived for `height`.
    Abandon { height: u64 },
}

struct BlockOutcome {
    height: u64,
    result: Result<SequencedBlock, BlockError>,
}

/// Drain-side state. Owned by the pipeline consumer, so it needs no locking.
struct CommitSequencer<H: TxHandler> {
    coordinator: Arc<BlockCoordinator<H>>,
    detector: ConflictDetector,
    outcomes: Sender<BlockOutcome>,
    height: u64,
    accumulator: BlockAccumulator,
    pending: BTreeMap<TxIndex, ExecutionResult>,
    responses: Vec<TxResponse>,
    next: TxIndex,
    received: usize,
    total: usize,
    reruns: usize,
    failure: Option<BlockError>,
}

impl<H: TxHandler> CommitSequencer<H> {
    fn new(
        coordinator: Arc<BlockCoordinator<H>>,
        detector: ConflictDetector,
        outcomes: Sender<BlockOutcome>,
    ) -> Self {
        Self {
            coordinator,
            detector,
            outcomes,
            height: 0,
            accumulator: BlockAccumulator::new(),
            pending: BTreeMap::new(),
            responses: Vec::new(),
            next: 0,
            received: 0,
            total: 0,
            reruns: 0,
            failure: None,
        }
    }

    fn handle(&mut self, item: BlockItem) {
        match item {
            BlockItem::Result {
                height,
                total,
                result,
            } => self.handle_result(height, total, result),
            BlockItem::Abandon { height } => {
                if height >= self.height {
                    if height == self.height && self.received > 0 {
                        warn!(height, received = self.received, total = self.total, "abandoning block");
                    }
                    self.reset();
                    self.height = height;
                }
                self.send(height, Err(BlockError::Abandoned));
            }
        }
    }

    fn handle_result(&mut self, height: u64, total: usize, result: ExecutionResult) {
        // A zero total at the current height means the block already ended.
        if height < self.height || (height == self.height && self.total == 0) {
            trace!(height, current = self.height, tx = result.sequence, "dropping result of an earlier block");
            return;
        }
        if height > self.height {
            if self.received > 0 {
                warn!(
                    height = self.height,
                    received = self.received,
                    total = self.total,
                    "discarding unfinished block"
                );
            }
            self.reset();
            self.height = height;
            self.total = total;
        }
        self.received += 1;

        if self.failure.is_none() {
            self.pending.insert(result.sequence, result);
            if let Err(err) = self.commit_ready() {
                error!(%err, height, tx = self.next, "commit failed, abandoning block");
                self.failure = Some(err);
                self.pending.clear();
            }
        }

        // Results of a failed block are still counted so that its outcome is
        // reported once, after the last result.
        if self.received >= self.total {
            self.finish();
        }
    }

    fn commit_ready(&mut self) -> Result<(), BlockError> {
        while let Some(result) = self.pending.remove(&self.next) {
            self.accept(result)?;
            self.next += 1;
        }
        Ok(())
    }

    fn accept(&mut self, result: ExecutionResult) -> Result<(), BlockError> {
        let index = result.sequence;
        let rerun = self.detector.conflict(&result, &self.accumulator);
        let mut result = if rerun {
            debug!(tx = index, "conflict, re-executing");
            self.reruns += 1;
            self.coordinator.run_one(index, ExecMode::Deliver)?
        } else {
            result
        };

        self.detector.collect(&result, &mut self.accumulator);
        self.coordinator.record_outcome(&result, rerun)?;
        self.responses.push(std::mem::take(&mut result.response));
        result.commit();
        Ok(())
    }

    fn finish(&mut self) {
        let result = match self.failure.take() {
            Some(err) => Err(err),
            None => Ok(SequencedBlock {
                responses: std::mem::take(&mut self.responses),
                accumulator: std::mem::take(&mut self.accumulator),
                reruns: self.reruns,
            }),
        };
        self.reset();
        self.send(self.height, result);
    }

    /// Clears per-block state. The height is kept so that late results of
    /// this block are still recognized as stale.
    fn reset(&mut self) {
        self.pending.clear();
        self.responses.clear();
        self.accumulator.clear();
        self.next = 0;
        self.received = 0;
        self.total = 0;
        self.reruns = 0;
        self.failure = None;
    }

    fn send(&self, height: u64, result: Result<SequencedBlock, BlockError>) {
        if self.outcomes.send(BlockOutcome { height, result }).is_err() {
            warn!(height, "block caller is gone, dropping block outcome");
        }
    }
}

// ============================================================================
// Parallel delivery
// ============================================================================

/// Delivers blocks by speculative parallel execution.
///
/// The result pipeline and its consumer are started once and reused for every
/// block. Blocks are delivered one at a time.
pub struct ParallelDeliver<H: TxHandler + 'static> {
    coordinator: Arc<BlockCoordinator<H>>,
    pipeline: ResultPipeline<BlockItem>,
    outcomes: Receiver<BlockOutcome>,
    num_threads: usize,
    height: AtomicU64,
    poisoned: AtomicBool,
}

impl<H: TxHandler + 'static> ParallelDeliver<H> {
    pub fn new(
        handler: Arc<H>,
        store: Arc<dyn StateStore>,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let coordinator = Arc::new(BlockCoordinator::new(
            handler,
            store,
            Arc::new(FeeLedger::new()),
            config.fee_collector,
        ));
        let detector = ConflictDetector::new(ExemptAccountSet::new(config.exempt_accounts));
        let (outcome_tx, outcomes) = unbounded();
        let mut sequencer = CommitSequencer::new(coordinator.clone(), detector, outcome_tx);
        let pipeline = ResultPipeline::start(config.queue_capacity, move |item: BlockItem| {
            sequencer.handle(item)
        })?;

        Ok(Self {
            coordinator,
            pipeline,
            outcomes,
            num_threads: config.num_threads.max(1),
            height: AtomicU64::new(0),
            poisoned: AtomicBool::new(false),
        })
    }

    pub fn coordinator(&self) -> &Arc<BlockCoordinator<H>> {
        &self.coordinator
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Returns true once a block failed after its transactions started
    /// committing.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Delivers one block and settles its fees.
    ///
    /// A block rejected by `prepare` leaves no trace and the next block can be
    /// delivered. Any later failure is not rolled back: transactions committed
    /// before it stay in the store and their fees are never credited. The
    /// block is aborted and the instance is poisoned, so every later call
    /// returns [`PipelineError::Poisoned`].
    pub fn deliver_block(&self, raw_txs: Vec<Bytes>) -> Result<BlockDelivery, DeliverError> {
        if self.is_poisoned() {
            return Err(PipelineError::Poisoned.into());
        }
        let start = Instant::now();
        self.coordinator.prepare(raw_txs)?;
        let height = self.height.fetch_add(1, Ordering::Relaxed) + 1;
        let total = self.coordinator.tx_count();

        let sequenced = if total == 0 {
            SequencedBlock {
                responses: Vec::new(),
                accumulator: BlockAccumulator::new(),
                reruns: 0,
            }
        } else {
            match self.sequence(height, total) {
                Ok(sequenced) => sequenced,
                Err(err) => return Err(self.poison(height, err)),
            }
        };

        let log = match self.coordinator.finalize() {
            Ok(log) => log,
            Err(err) => return Err(self.poison(height, err.into())),
        };
        let stats = BlockStats {
            txs: total,
            parallel: total - sequenced.reruns,
            reruns: sequenced.reruns,
            duration: start.elapsed(),
        };
        info!(
            height,
            txs = stats.txs,
            parallel = stats.parallel,
            reruns = stats.reruns,
            fee = %log.fee_collected,
            elapsed_ms = stats.duration.as_millis() as u64,
            "Paralleled-tx"
        );

        Ok(BlockDelivery {
            log,
            responses: sequenced.responses,
            accumulator: sequenced.accumulator,
            stats,
        })
    }

    fn poison(&self, height: u64, err: DeliverError) -> DeliverError {
        error!(height, %err, "block failed after execution started, refusing further blocks");
        self.poisoned.store(true, Ordering::Release);
        self.coordinator.abort();
        err
    }

    /// Executes the prepared block and waits for the sequencer's outcome.
    fn sequence(&self, height: u64, total: usize) -> Result<SequencedBlock, DeliverError> {
        if let Err(err) = self.run_workers(height, total) {
            // The sequencer must be done with this block before the
            // coordinator is reset.
            let acked = self
                .pipeline
                .push(BlockItem::Abandon { height })
                .and_then(|()| self.recv_outcome(height));
            if let Err(ack_err) = acked {
                warn!(height, %ack_err, "abandoned block was not acknowledged");
            }
            return Err(err.into());
        }
        Ok(self.recv_outcome(height)??)
    }

    /// Receives the outcome for `height`, skipping outcomes of earlier blocks.
    fn recv_outcome(&self, height: u64) -> Result<Result<SequencedBlock, BlockError>, PipelineError> {
        loop {
            let outcome = self
                .outcomes
                .recv()
                .map_err(|_| PipelineError::ConsumerPanicked)?;
            if outcome.height == height {
                return Ok(outcome.result);
            }
            debug!(stale = outcome.height, height, "dropping outcome of an earlier block");
        }
    }

    /// Runs every transaction of the prepared block once and pushes the
    /// results. Returns when all results are queued.
    fn run_workers(&self, height: u64, total: usize) -> Result<(), PipelineError> {
        let sender = self.pipeline.sender().ok_or(PipelineError::Closed)?;
        let next = AtomicUsize::new(0);
        let workers = self.num_threads.min(total);

        thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|worker_id| {
                    let sender = sender.clone();
                    let next = &next;
                    let coordinator = &self.coordinator;
                    scope.spawn(move || -> Result<(), PipelineError> {
                        let mut executed = 0usize;
                        loop {
                            let index = next.fetch_add(1, Ordering::Relaxed);
                            if index >= total {
                                break;
                            }
                            let index = index as TxIndex;
                            let result = coordinator
                                .run_one(index, ExecMode::DeliverInAsync)
                                .unwrap_or_else(|err| {
                                    warn!(%err, tx = index, "speculative run failed");
                                    ExecutionResult::missing(index)
                                });
                            sender.push(BlockItem::Result {
                                height,
                                total,
                                result,
                            })?;
                            executed += 1;
                        }
                        trace!(worker_id, executed, "worker finished");
                        Ok(())
                    })
                })
                .collect();

            let mut outcome = Ok(());
            for handle in handles {
                let joined = handle
                    .join()
                    .unwrap_or(Err(PipelineError::WorkerPanicked));
                if outcome.is_ok() {
                    outcome = joined;
                }
            }
            outcome
        })
    }

    /// Stops the result consumer after it drained the queue.
    pub fn shutdown(self) -> Result<(), PipelineError> {
        let Self { pipeline, .. } = self;
        pipeline.shutdown()
    }
}
