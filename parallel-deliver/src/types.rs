//! Core types for speculative block delivery.

use crate::error::TxError;
use crate::scratch::ScratchStore;
use alloy_primitives::{Address, Bytes, U256};
use std::collections::BTreeMap;
use std::fmt;

/// Transaction index in the block (0-based).
pub type TxIndex = u32;

/// Index of a transaction among the EVM transactions of the block (0-based).
pub type EvmIndex = u32;

/// Key prefix under which account records are stored.
pub const ACCOUNT_KEY_PREFIX: u8 = 0x01;

/// Returns the state key of an account record: `0x01 ‖ address`.
pub fn account_key(address: &Address) -> Vec<u8> {
    let mut key = Vec::with_capacity(21);
    key.push(ACCOUNT_KEY_PREFIX);
    key.extend_from_slice(address.as_slice());
    key
}

/// Returns the fee-ledger key of a transaction: raw bytes followed by the
/// little-endian block index.
///
/// Suffixing the index keeps keys unique when a block carries two
/// byte-identical transactions.
pub fn tx_key(raw: &[u8], index: TxIndex) -> Vec<u8> {
    let mut key = Vec::with_capacity(raw.len() + 4);
    key.extend_from_slice(raw);
    key.extend_from_slice(&index.to_le_bytes());
    key
}

// ============================================================================
// Coins
// ============================================================================

/// A multi-denomination amount, kept sorted by denomination.
///
/// Zero amounts are never stored, so two equal amounts always compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Coins(BTreeMap<String, U256>);

impl Coins {
    /// Creates an empty amount.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an amount holding a single denomination.
    pub fn from_coin(denom: impl Into<String>, amount: U256) -> Self {
        let mut coins = Self::new();
        coins.add_coin(denom, amount);
        coins
    }

    /// Returns the amount held in `denom`.
    pub fn amount_of(&self, denom: &str) -> U256 {
        self.0.get(denom).copied().unwrap_or(U256::ZERO)
    }

    /// Adds a single coin, saturating at `U256::MAX`.
    pub fn add_coin(&mut self, denom: impl Into<String>, amount: U256) {
        if amount.is_zero() {
            return;
        }
        let entry = self.0.entry(denom.into()).or_insert(U256::ZERO);
        *entry = entry.saturating_add(amount);
    }

    /// Adds every denomination of `other`.
    pub fn add(&mut self, other: &Coins) {
        for (denom, amount) in &other.0 {
            self.add_coin(denom.clone(), *amount);
        }
    }

    /// Subtracts `other`, clamping each denomination at zero.
    ///
    /// Returns the difference and whether any denomination had to be clamped.
    pub fn saturating_sub(&self, other: &Coins) -> (Coins, bool) {
        let mut clamped = false;
        let mut out = BTreeMap::new();
        for (denom, amount) in &self.0 {
            let sub = other.amount_of(denom);
            if sub > *amount {
                clamped = true;
            }
            let diff = amount.saturating_sub(sub);
            if !diff.is_zero() {
                out.insert(denom.clone(), diff);
            }
        }
        if other.0.keys().any(|denom| !self.0.contains_key(denom)) {
            clamped = true;
        }
        (Coins(out), clamped)
    }

    /// Returns true if no denomination holds a non-zero amount.
    pub fn is_zero(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over `(denom, amount)` pairs in denomination order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &U256)> {
        self.0.iter().map(|(denom, amount)| (denom.as_str(), amount))
    }
}

impl fmt::Display for Coins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (denom, amount) in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{}{}", amount, denom)?;
            first = false;
        }
        Ok(())
    }
}

// ============================================================================
// Per-transaction metadata
// ============================================================================

/// Status of a transaction in the current block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxStatus {
    pub index_in_block: TxIndex,
    pub is_evm: bool,
    /// Set only for EVM transactions, dense over them in block order.
    pub evm_index: Option<EvmIndex>,
    /// Fee or validity pre-check failure. Excludes the transaction from fee settlement.
    pub ante_error: Option<String>,
    /// Failure after the pre-checks passed. Fees are still charged.
    pub deliver_error: Option<String>,
    /// Whether the accepted result came from a re-execution after a conflict.
    pub rerun: bool,
    pub gas_used: u64,
}

impl TxStatus {
    /// The message recorded in the execution log, empty on success.
    pub fn error_message(&self) -> String {
        self.ante_error
            .clone()
            .or_else(|| self.deliver_error.clone())
            .unwrap_or_default()
    }
}

/// Mode a transaction is delivered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecMode {
    /// Serial delivery against the latest committed state.
    #[default]
    Deliver,
    /// Speculative delivery on a worker, validated before commit.
    DeliverInAsync,
}

/// Block-level context handed to the execution contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxContext {
    pub index_in_block: TxIndex,
    pub evm_index: Option<EvmIndex>,
    pub mode: ExecMode,
}

/// An event emitted by a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Event {
    pub kind: String,
    pub attributes: Vec<(String, String)>,
}

impl Event {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attributes: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }
}

/// Response of delivering one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxResponse {
    pub gas_wanted: u64,
    pub gas_used: u64,
    pub log: String,
    pub data: Bytes,
    pub events: Vec<Event>,
}

/// What the execution contract reports for a single delivery.
#[derive(Debug, Clone, Default)]
pub struct DeliverOutcome {
    pub response: TxResponse,
    pub error: Option<TxError>,
    /// Part of the prepaid fee returned to the sender.
    pub refund: Option<Coins>,
}

// ============================================================================
// Execution results
// ============================================================================

/// Output of running one transaction.
///
/// The scratch overlay is owned by the result until the commit sequencer
/// validates it. A result without an overlay can never be accepted.
#[derive(Debug)]
pub struct ExecutionResult {
    pub response: TxResponse,
    pub scratch: Option<ScratchStore>,
    /// Block index of the transaction, used to restore block order.
    pub sequence: TxIndex,
    pub evm_index: Option<EvmIndex>,
    pub error: Option<TxError>,
}

impl ExecutionResult {
    pub fn new(
        sequence: TxIndex,
        response: TxResponse,
        scratch: Option<ScratchStore>,
        error: Option<TxError>,
    ) -> Self {
        Self {
            response,
            scratch,
            sequence,
            evm_index: None,
            error,
        }
    }

    /// A result with no state to check. It is always treated as conflicting.
    pub fn missing(sequence: TxIndex) -> Self {
        Self::new(sequence, TxResponse::default(), None, None)
    }

    /// Returns true if the pre-checks rejected the transaction.
    pub fn ante_failed(&self) -> bool {
        matches!(self.error, Some(TxError::Ante(_)))
    }

    /// Writes the overlay into committed state and drops it.
    ///
    /// Returns false if there was no overlay to commit.
    pub fn commit(&mut self) -> bool {
        match self.scratch.take() {
            Some(scratch) => {
                scratch.write();
                true
            }
            None => false,
        }
    }
}

/// One line of the block's audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub tx: Bytes,
    /// Empty when the transaction succeeded.
    pub error: String,
    pub evm_index: Option<EvmIndex>,
    pub gas_used: u64,
}

/// Execution log produced by `finalize`, in block order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionLog {
    pub entries: Vec<LogEntry>,
    /// Net fees credited to the fee collector.
    pub fee_collected: Coins,
}

impl ExecutionLog {
    /// Number of transactions that completed without error.
    pub fn successful(&self) -> usize {
        self.entries.iter().filter(|entry| entry.error.is_empty()).count()
    }

    /// Number of transactions that reported an error.
    pub fn failed(&self) -> usize {
        self.entries.len() - self.successful()
    }
}
