//! Benchmarking harness for speculative parallel block delivery.
//!
//! This crate drives the `parallel-deliver` pipeline with generated blocks of
//! signed value transfers and compares it against plain sequential delivery.
//!
//! # Architecture
//!
//! The harness is organized around three main concepts:
//!
//! - **Workload**: Pre-generated accounts and signed transfers, split into blocks
//! - **TransferApp**: The state machine that decodes, checks and applies transfers
//! - **Executor**: A strategy for delivering the blocks (sequential or parallel)
//!
//! # Quick Start
//!
//! ```
//! use deliver_bench::{Executor, SequentialExecutor, Workload, WorkloadConfig};
//!
//! let config = WorkloadConfig {
//!     num_accounts: 100,
//!     num_transactions: 50,
//!     transactions_per_block: 25,
//!     ..Default::default()
//! };
//!
//! // Generate workload (signs all transactions upfront)
//! let workload = Workload::generate(config);
//!
//! let executor = SequentialExecutor::new(true);
//! let (store, result) = executor.execute(&workload).unwrap();
//!
//! println!("Successful: {} root: {}", result.successful, store.state_root());
//! ```

pub mod app;
pub mod executor;

pub use app::{decode_account, encode_account, export_cache_db, TransferApp, DENOM};
pub use executor::{Executor, ParallelExecutor, SequentialExecutor, WorkloadResult};

use alloy_primitives::{keccak256, Address, Bytes, Signature, B256, U256};
use k256::ecdsa::{SigningKey, VerifyingKey};
use parallel_deliver::{account_key, MemStore, StateStore, FEE_COLLECTOR};
use rand::{rngs::StdRng, Rng, SeedableRng};
use revm::state::AccountInfo;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Intrinsic gas of a plain transfer.
pub const TRANSFER_GAS: u64 = 21_000;

/// Balance every generated account starts with (1000 ETH).
pub const INITIAL_BALANCE: u128 = 1_000_000_000_000_000_000_000;

/// Value moved by every generated transfer (0.001 ETH).
pub const TRANSFER_VALUE: u64 = 1_000_000_000_000_000;

/// Nonce offset used to make a transaction fail its pre-checks.
const INVALID_NONCE_GAP: u64 = 1_000;

// ============================================================================
// Account & Key Management
// ============================================================================

/// An account with its signing key for transaction signing.
#[derive(Clone)]
pub struct Account {
    /// The secp256k1 signing key.
    pub signing_key: SigningKey,
    /// The Ethereum address derived from the public key.
    pub address: Address,
}

impl Account {
    /// Creates a new account from a signing key.
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = VerifyingKey::from(&signing_key);
        let address = public_key_to_address(&verifying_key);
        Self { signing_key, address }
    }

    /// Generates a deterministic account from a seed.
    pub fn from_seed(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut key_bytes = [0u8; 32];
        rng.fill(&mut key_bytes);
        let signing_key = SigningKey::from_bytes(&key_bytes.into()).expect("valid key bytes");
        Self::from_signing_key(signing_key)
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("address", &self.address)
            .finish()
    }
}

/// Derives an Ethereum address from a secp256k1 public key.
fn public_key_to_address(verifying_key: &VerifyingKey) -> Address {
    let public_key_bytes = verifying_key.to_encoded_point(false);
    // Skip the 0x04 prefix byte, hash the rest.
    let hash = keccak256(&public_key_bytes.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

// ============================================================================
// Signed Transaction
// ============================================================================

/// Execution flavour of a transfer. EVM transfers get an `evm_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxKind {
    Native = 0x01,
    Evm = 0x02,
}

impl TryFrom<u8> for TxKind {
    type Error = DecodeError;

    fn try_from(byte: u8) -> Result<Self, DecodeError> {
        match byte {
            0x01 => Ok(TxKind::Native),
            0x02 => Ok(TxKind::Evm),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }
}

/// Errors raised while decoding raw transaction bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid transaction length: expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("unknown transaction kind {0:#04x}")]
    UnknownKind(u8),
    #[error("invalid signature parity byte {0}")]
    InvalidParity(u8),
}

/// Unsigned fields of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxRequest {
    pub kind: TxKind,
    pub chain_id: u64,
    pub to: Address,
    pub value: U256,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: u64,
}

/// A signed transfer ready for delivery.
///
/// Wire layout, all integers big-endian:
///
/// ```text
/// kind(1) chain_id(8) from(20) to(20) value(32) nonce(8) gas_limit(8)
/// gas_price(8) r(32) s(32) y_parity(1)
/// ```
///
/// The signed hash is the keccak of everything before the signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub kind: TxKind,
    pub chain_id: u64,
    /// The sender's address (checked against the signature during the ante step).
    pub from: Address,
    pub to: Address,
    /// The value to transfer in wei.
    pub value: U256,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: u64,
    /// The ECDSA signature.
    pub signature: Signature,
    /// The hash of the transaction data that was signed.
    pub tx_hash: B256,
}

impl SignedTransaction {
    /// Length of the unsigned prefix.
    pub const UNSIGNED_LEN: usize = 1 + 8 + 20 + 20 + 32 + 8 + 8 + 8;
    /// Length of an encoded transaction.
    pub const ENCODED_LEN: usize = Self::UNSIGNED_LEN + 32 + 32 + 1;

    /// Signs `request` with the key of `account`.
    pub fn sign(account: &Account, request: TxRequest) -> Self {
        let unsigned = encode_unsigned(account.address, &request);
        let tx_hash = keccak256(&unsigned);
        let (sig, recovery_id) = account
            .signing_key
            .sign_prehash_recoverable(tx_hash.as_slice())
            .expect("signing should succeed");

        Self {
            kind: request.kind,
            chain_id: request.chain_id,
            from: account.address,
            to: request.to,
            value: request.value,
            nonce: request.nonce,
            gas_limit: request.gas_limit,
            gas_price: request.gas_price,
            signature: Signature::from_signature_and_parity(sig, recovery_id.is_y_odd()),
            tx_hash,
        }
    }

    fn request(&self) -> TxRequest {
        TxRequest {
            kind: self.kind,
            chain_id: self.chain_id,
            to: self.to,
            value: self.value,
            nonce: self.nonce,
            gas_limit: self.gas_limit,
            gas_price: self.gas_price,
        }
    }

    /// Maximum fee the sender prepays: `gas_limit * gas_price`.
    pub fn fee(&self) -> U256 {
        U256::from(self.gas_limit) * U256::from(self.gas_price)
    }

    /// Encodes the transaction into its wire format.
    pub fn encode(&self) -> Bytes {
        let mut out = encode_unsigned(self.from, &self.request());
        out.extend_from_slice(&self.signature.r().to_be_bytes::<32>());
        out.extend_from_slice(&self.signature.s().to_be_bytes::<32>());
        out.push(self.signature.v() as u8);
        out.into()
    }

    /// Decodes a transaction from its wire format.
    ///
    /// Only the layout is checked; the signature is verified by the ante step.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        if raw.len() != Self::ENCODED_LEN {
            return Err(DecodeError::Length {
                expected: Self::ENCODED_LEN,
                actual: raw.len(),
            });
        }

        let mut reader = Reader { buf: raw, pos: 0 };
        let kind = TxKind::try_from(reader.take(1)[0])?;
        let chain_id = reader.u64();
        let from = Address::from_slice(reader.take(20));
        let to = Address::from_slice(reader.take(20));
        let value = U256::from_be_slice(reader.take(32));
        let nonce = reader.u64();
        let gas_limit = reader.u64();
        let gas_price = reader.u64();
        let r = U256::from_be_slice(reader.take(32));
        let s = U256::from_be_slice(reader.take(32));
        let y_parity = match reader.take(1)[0] {
            0 => false,
            1 => true,
            other => return Err(DecodeError::InvalidParity(other)),
        };

        Ok(Self {
            kind,
            chain_id,
            from,
            to,
            value,
            nonce,
            gas_limit,
            gas_price,
            signature: Signature::new(r, s, y_parity),
            tx_hash: keccak256(&raw[..Self::UNSIGNED_LEN]),
        })
    }

    /// Recovers the sender's address from the signature.
    /// Returns None if signature verification fails.
    pub fn recover_signer(&self) -> Option<Address> {
        self.signature
            .recover_address_from_prehash(&self.tx_hash)
            .ok()
    }

    /// Verifies the signature and returns true if valid.
    pub fn verify(&self) -> bool {
        self.recover_signer()
            .map(|addr| addr == self.from)
            .unwrap_or(false)
    }
}

fn encode_unsigned(from: Address, request: &TxRequest) -> Vec<u8> {
    let mut data = Vec::with_capacity(SignedTransaction::ENCODED_LEN);
    data.push(request.kind as u8);
    data.extend_from_slice(&request.chain_id.to_be_bytes());
    data.extend_from_slice(from.as_slice());
    data.extend_from_slice(request.to.as_slice());
    data.extend_from_slice(&request.value.to_be_bytes::<32>());
    data.extend_from_slice(&request.nonce.to_be_bytes());
    data.extend_from_slice(&request.gas_limit.to_be_bytes());
    data.extend_from_slice(&request.gas_price.to_be_bytes());
    data
}

/// Cursor over a buffer whose length was already checked.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> &'a [u8] {
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        out
    }

    fn u64(&mut self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8));
        u64::from_be_bytes(bytes)
    }
}

// ============================================================================
// Workload Configuration & Generation
// ============================================================================

/// Configuration for workload generation.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Total number of accounts in the system.
    pub num_accounts: usize,
    /// Number of transactions to generate.
    pub num_transactions: usize,
    /// Transactions per block. The last block may be shorter.
    pub transactions_per_block: usize,
    /// Conflict factor: 0.0 = no conflicts, 1.0 = all transactions touch same accounts.
    pub conflict_factor: f64,
    /// Share of transactions marked as EVM transfers.
    pub evm_ratio: f64,
    /// Share of transactions signed with a wrong nonce, which fail the ante step.
    pub invalid_ratio: f64,
    /// Random seed for reproducibility.
    pub seed: u64,
    /// Chain ID for transaction signing.
    pub chain_id: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            num_accounts: 1000,
            num_transactions: 100,
            transactions_per_block: 100,
            conflict_factor: 0.0,
            evm_ratio: 0.5,
            invalid_ratio: 0.0,
            seed: 42,
            chain_id: 1,
        }
    }
}

/// A complete benchmark workload with pre-generated accounts and signed blocks.
#[derive(Debug, Clone)]
pub struct Workload {
    /// The accounts (with signing keys) participating in this workload.
    pub accounts: Vec<Account>,
    /// The pre-signed transactions, grouped into blocks.
    pub blocks: Vec<Vec<SignedTransaction>>,
    /// The configuration used to generate this workload.
    pub config: WorkloadConfig,
}

impl Workload {
    /// Generates a new workload from the given configuration.
    /// All transactions are pre-signed during generation.
    pub fn generate(config: WorkloadConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);

        // Generate accounts with deterministic keys.
        let accounts: Vec<Account> = (0..config.num_accounts)
            .map(|i| Account::from_seed(config.seed.wrapping_add(i as u64)))
            .collect();

        // Track nonces per account for proper transaction sequencing.
        let mut nonces: HashMap<usize, u64> = HashMap::new();

        // Calculate "hot" account range for conflict simulation.
        let hot_account_count = if config.conflict_factor > 0.0 {
            (2.0 + (1.0 - config.conflict_factor) * (config.num_accounts as f64 - 2.0))
                .max(2.0) as usize
        } else {
            config.num_accounts
        };

        let transactions: Vec<SignedTransaction> = (0..config.num_transactions)
            .map(|_| {
                let use_hot = rng.gen::<f64>() < config.conflict_factor;
                let pool = if use_hot {
                    hot_account_count
                } else {
                    config.num_accounts
                };
                let from_idx = rng.gen_range(0..pool);
                let mut to_idx = rng.gen_range(0..pool);
                while to_idx == from_idx {
                    to_idx = rng.gen_range(0..pool);
                }

                let kind = if rng.gen::<f64>() < config.evm_ratio {
                    TxKind::Evm
                } else {
                    TxKind::Native
                };
                let invalid = rng.gen::<f64>() < config.invalid_ratio;
                let next_nonce = nonces.entry(from_idx).or_insert(0);
                let nonce = if invalid {
                    *next_nonce + INVALID_NONCE_GAP
                } else {
                    *next_nonce += 1;
                    *next_nonce - 1
                };

                SignedTransaction::sign(
                    &accounts[from_idx],
                    TxRequest {
                        kind,
                        chain_id: config.chain_id,
                        to: accounts[to_idx].address,
                        value: U256::from(TRANSFER_VALUE),
                        nonce,
                        gas_limit: TRANSFER_GAS + rng.gen_range(0..=4_000),
                        gas_price: rng.gen_range(1..=3),
                    },
                )
            })
            .collect();

        let blocks = transactions
            .chunks(config.transactions_per_block.max(1))
            .map(<[SignedTransaction]>::to_vec)
            .collect();

        Self {
            accounts,
            blocks,
            config,
        }
    }

    /// Total number of transactions across all blocks.
    pub fn num_transactions(&self) -> usize {
        self.blocks.iter().map(Vec::len).sum()
    }

    /// Encoded transactions, block by block.
    pub fn raw_blocks(&self) -> Vec<Vec<Bytes>> {
        self.blocks
            .iter()
            .map(|block| block.iter().map(SignedTransaction::encode).collect())
            .collect()
    }

    /// Creates a committed store with every account funded and an empty
    /// fee-collector account.
    pub fn create_store(&self) -> Arc<MemStore> {
        self.create_store_with_collector(FEE_COLLECTOR)
    }

    /// Like [`Workload::create_store`], with `collector` as the fee collector.
    pub fn create_store_with_collector(&self, collector: Address) -> Arc<MemStore> {
        let store = MemStore::new();
        let initial_balance = U256::from(INITIAL_BALANCE);

        for account in &self.accounts {
            let info = AccountInfo {
                balance: initial_balance,
                nonce: 0,
                code_hash: revm::primitives::KECCAK_EMPTY,
                code: None,
            };
            store.set(account_key(&account.address), encode_account(&info));
        }
        store.set(
            account_key(&collector),
            encode_account(&AccountInfo::default()),
        );

        Arc::new(store)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn request(to: Address, nonce: u64) -> TxRequest {
        TxRequest {
            kind: TxKind::Evm,
            chain_id: 1,
            to,
            value: U256::from(1000),
            nonce,
            gas_limit: 25_000,
            gas_price: 2,
        }
    }

    #[test]
    fn test_account_generation() {
        let acc1 = Account::from_seed(1);
        let acc2 = Account::from_seed(2);

        // Different seeds produce different accounts.
        assert_ne!(acc1.address, acc2.address);

        // Same seed produces same account.
        let acc1_copy = Account::from_seed(1);
        assert_eq!(acc1.address, acc1_copy.address);
    }

    #[test]
    fn test_signature_verification() {
        let account = Account::from_seed(42);
        let tx = SignedTransaction::sign(&account, request(Address::ZERO, 0));

        assert!(tx.verify());
        assert_eq!(tx.recover_signer(), Some(account.address));
        assert_eq!(tx.fee(), U256::from(50_000));
    }

    #[test]
    fn test_encoded_transaction_keeps_valid_signature() {
        let account = Account::from_seed(7);
        let tx = SignedTransaction::sign(&account, request(Address::repeat_byte(0x11), 3));

        let raw = tx.encode();
        assert_eq!(raw.len(), SignedTransaction::ENCODED_LEN);

        let decoded = SignedTransaction::decode(&raw).unwrap();
        assert_eq!(decoded, tx);
        assert!(decoded.verify());
    }

    #[test]
    fn test_tampered_transaction_fails_verification() {
        let account = Account::from_seed(7);
        let tx = SignedTransaction::sign(&account, request(Address::repeat_byte(0x11), 3));

        let mut raw = tx.encode().to_vec();
        // Bump the low byte of the value.
        raw[1 + 8 + 20 + 20 + 31] ^= 0x01;
        let decoded = SignedTransaction::decode(&raw).unwrap();
        assert!(!decoded.verify());
    }

    #[test]
    fn test_decode_rejects_malformed_input() {
        assert_eq!(
            SignedTransaction::decode(&[0x01; 10]),
            Err(DecodeError::Length {
                expected: SignedTransaction::ENCODED_LEN,
                actual: 10
            })
        );

        let account = Account::from_seed(1);
        let mut raw = SignedTransaction::sign(&account, request(Address::ZERO, 0))
            .encode()
            .to_vec();
        raw[0] = 0x07;
        assert_eq!(
            SignedTransaction::decode(&raw),
            Err(DecodeError::UnknownKind(0x07))
        );

        raw[0] = TxKind::Native as u8;
        raw[SignedTransaction::ENCODED_LEN - 1] = 5;
        assert_eq!(
            SignedTransaction::decode(&raw),
            Err(DecodeError::InvalidParity(5))
        );
    }

    #[test]
    fn test_workload_generation() {
        let config = WorkloadConfig {
            num_accounts: 10,
            num_transactions: 25,
            transactions_per_block: 10,
            seed: 123,
            ..Default::default()
        };

        let workload = Workload::generate(config);

        assert_eq!(workload.accounts.len(), 10);
        let sizes: Vec<usize> = workload.blocks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        assert_eq!(workload.num_transactions(), 25);

        // All transactions should have valid signatures.
        for tx in workload.blocks.iter().flatten() {
            assert!(tx.verify(), "Transaction signature should be valid");
            assert!(tx.gas_limit >= TRANSFER_GAS);
        }
    }

    #[test]
    fn test_invalid_transactions_do_not_advance_nonces() {
        let config = WorkloadConfig {
            num_accounts: 4,
            num_transactions: 40,
            invalid_ratio: 0.5,
            ..Default::default()
        };

        let workload = Workload::generate(config);

        let mut expected: HashMap<Address, u64> = HashMap::new();
        let mut invalid = 0;
        for tx in workload.blocks.iter().flatten() {
            let next = expected.entry(tx.from).or_insert(0);
            if tx.nonce >= INVALID_NONCE_GAP {
                assert_eq!(tx.nonce, *next + INVALID_NONCE_GAP);
                invalid += 1;
            } else {
                assert_eq!(tx.nonce, *next);
                *next += 1;
            }
        }
        assert!(invalid > 0);
    }

    #[test]
    fn test_evm_ratio_extremes() {
        let all_evm = Workload::generate(WorkloadConfig {
            num_accounts: 5,
            num_transactions: 20,
            evm_ratio: 1.0,
            ..Default::default()
        });
        assert!(all_evm.blocks.iter().flatten().all(|tx| tx.kind == TxKind::Evm));

        let native = Workload::generate(WorkloadConfig {
            num_accounts: 5,
            num_transactions: 20,
            evm_ratio: 0.0,
            ..Default::default()
        });
        assert!(native.blocks.iter().flatten().all(|tx| tx.kind == TxKind::Native));
    }

    #[test]
    fn test_store_funds_accounts_and_collector() {
        let workload = Workload::generate(WorkloadConfig {
            num_accounts: 3,
            num_transactions: 0,
            ..Default::default()
        });

        let store = workload.create_store();

        assert_eq!(store.len(), 4);
        let info = store
            .get(&account_key(&workload.accounts[0].address))
            .and_then(|raw| decode_account(&raw))
            .unwrap();
        assert_eq!(info.balance, U256::from(INITIAL_BALANCE));
        assert!(store.get(&account_key(&FEE_COLLECTOR)).is_some());
    }
}
