//! Value-transfer state machine delivered by the pipeline.
//!
//! Accounts are stored under [`account_key`] as a fixed 72-byte record:
//! `nonce(8) ‖ balance(32) ‖ code_hash(32)`, all big-endian.
//!
//! Delivery of one transfer:
//!
//! 1. Ante: signature, chain id, nonce, and `balance >= value + fee` checks;
//!    the fee-collector account must exist. The full fee is deducted and the
//!    nonce bumped.
//! 2. Execution: the value moves to the recipient.
//! 3. Unused gas `(gas_limit - 21000) * gas_price` is refunded to the sender
//!    and reported as the refund, so that only the used part of the fee is
//!    credited to the fee collector at the end of the block.

use crate::{DecodeError, SignedTransaction, TxKind, TRANSFER_GAS};
use alloy_primitives::{Address, Bytes, B256, U256};
use parallel_deliver::{
    account_key, Coins, DeliverOutcome, Event, MemStore, ScratchStore, TxContext, TxError,
    TxHandler, TxResponse, ACCOUNT_KEY_PREFIX, FEE_COLLECTOR,
};
use revm::database::{CacheDB, EmptyDB};
use revm::state::AccountInfo;

/// Denomination of all fees and balances.
pub const DENOM: &str = "wei";

const ACCOUNT_RECORD_LEN: usize = 8 + 32 + 32;

/// Encodes an account record.
pub fn encode_account(info: &AccountInfo) -> Vec<u8> {
    let mut out = Vec::with_capacity(ACCOUNT_RECORD_LEN);
    out.extend_from_slice(&info.nonce.to_be_bytes());
    out.extend_from_slice(&info.balance.to_be_bytes::<32>());
    out.extend_from_slice(info.code_hash.as_slice());
    out
}

/// Decodes an account record, returning `None` if it is malformed.
pub fn decode_account(raw: &[u8]) -> Option<AccountInfo> {
    if raw.len() != ACCOUNT_RECORD_LEN {
        return None;
    }
    let mut nonce = [0u8; 8];
    nonce.copy_from_slice(&raw[..8]);
    Some(AccountInfo {
        nonce: u64::from_be_bytes(nonce),
        balance: U256::from_be_slice(&raw[8..40]),
        code_hash: B256::from_slice(&raw[40..]),
        code: None,
    })
}

fn read_account(scratch: &mut ScratchStore, address: &Address) -> Option<AccountInfo> {
    scratch
        .get(&account_key(address))
        .and_then(|raw| decode_account(&raw))
}

fn write_account(scratch: &mut ScratchStore, address: &Address, info: &AccountInfo) {
    scratch.set(account_key(address), encode_account(info));
}

/// Loads every account of a committed store into a revm [`CacheDB`].
pub fn export_cache_db(store: &MemStore) -> CacheDB<EmptyDB> {
    let mut db = CacheDB::new(EmptyDB::default());
    for (key, value) in store.snapshot() {
        if key.len() != 21 || key[0] != ACCOUNT_KEY_PREFIX {
            continue;
        }
        if let Some(info) = decode_account(&value) {
            db.insert_account_info(Address::from_slice(&key[1..]), info);
        }
    }
    db
}

/// Transfer application implementing the delivery contract.
#[derive(Debug, Clone)]
pub struct TransferApp {
    /// Whether the ante step recovers and checks the signer.
    pub verify_signatures: bool,
    pub chain_id: u64,
    pub fee_collector: Address,
}

impl TransferApp {
    pub fn new(verify_signatures: bool, chain_id: u64) -> Self {
        Self {
            verify_signatures,
            chain_id,
            fee_collector: FEE_COLLECTOR,
        }
    }

    /// Uses `collector` for the ante existence check and the transfer guard.
    /// Must match the collector the block coordinator credits.
    pub fn with_fee_collector(mut self, collector: Address) -> Self {
        self.fee_collector = collector;
        self
    }

    fn ante(&self, tx: &SignedTransaction, scratch: &mut ScratchStore) -> Result<(), String> {
        if tx.chain_id != self.chain_id {
            return Err(format!("wrong chain id {}", tx.chain_id));
        }
        if self.verify_signatures && !tx.verify() {
            return Err("invalid signature".to_string());
        }
        if tx.gas_limit < TRANSFER_GAS {
            return Err(format!("gas limit {} below intrinsic gas", tx.gas_limit));
        }

        let mut sender = read_account(scratch, &tx.from).ok_or("unknown sender")?;
        if sender.nonce != tx.nonce {
            return Err(format!(
                "invalid nonce: expected {}, got {}",
                sender.nonce, tx.nonce
            ));
        }
        let fee = tx.fee();
        let cost = tx.value.checked_add(fee).ok_or("cost overflow")?;
        if sender.balance < cost {
            return Err(format!("insufficient funds: {} < {}", sender.balance, cost));
        }
        if read_account(scratch, &self.fee_collector).is_none() {
            return Err("fee collector account missing".to_string());
        }

        sender.balance -= fee;
        sender.nonce += 1;
        write_account(scratch, &tx.from, &sender);
        Ok(())
    }

    fn transfer(&self, tx: &SignedTransaction, scratch: &mut ScratchStore) -> Result<(), String> {
        // Fee-collector state is only written during settlement.
        if tx.to == self.fee_collector {
            return Err("transfers to the fee collector are not allowed".to_string());
        }

        let mut sender = read_account(scratch, &tx.from).ok_or("unknown sender")?;
        if tx.to == tx.from {
            return Ok(());
        }
        let mut recipient = read_account(scratch, &tx.to).unwrap_or_default();
        let credited = recipient
            .balance
            .checked_add(tx.value)
            .ok_or("recipient balance overflow")?;

        sender.balance -= tx.value;
        recipient.balance = credited;
        write_account(scratch, &tx.from, &sender);
        write_account(scratch, &tx.to, &recipient);
        Ok(())
    }

    fn refund_unused_gas(&self, tx: &SignedTransaction, scratch: &mut ScratchStore) -> U256 {
        let refund = U256::from(tx.gas_limit - TRANSFER_GAS) * U256::from(tx.gas_price);
        if refund.is_zero() {
            return refund;
        }
        if let Some(mut sender) = read_account(scratch, &tx.from) {
            sender.balance = sender.balance.saturating_add(refund);
            write_account(scratch, &tx.from, &sender);
        }
        refund
    }
}

impl TxHandler for TransferApp {
    type Tx = SignedTransaction;
    type Error = DecodeError;

    fn decode(&self, raw: &[u8]) -> Result<SignedTransaction, DecodeError> {
        SignedTransaction::decode(raw)
    }

    fn fee(&self, tx: &SignedTransaction) -> Coins {
        Coins::from_coin(DENOM, tx.fee())
    }

    fn is_evm(&self, tx: &SignedTransaction) -> bool {
        tx.kind == TxKind::Evm
    }

    fn deliver(&self, tx: &SignedTransaction, ctx: &TxContext, scratch: &mut ScratchStore) -> DeliverOutcome {
        let mut outcome = DeliverOutcome {
            response: TxResponse {
                gas_wanted: tx.gas_limit,
                ..Default::default()
            },
            ..Default::default()
        };

        if let Err(reason) = self.ante(tx, scratch) {
            outcome.response.log = reason.clone();
            outcome.error = Some(TxError::Ante(reason));
            return outcome;
        }

        outcome.response.gas_used = TRANSFER_GAS;
        let transferred = self.transfer(tx, scratch);
        let refund = self.refund_unused_gas(tx, scratch);
        outcome.refund = Some(Coins::from_coin(DENOM, refund));

        match transferred {
            Ok(()) => {
                let mut event = Event::new("transfer")
                    .with_attribute("sender", tx.from.to_string())
                    .with_attribute("recipient", tx.to.to_string())
                    .with_attribute("amount", tx.value.to_string());
                if let Some(evm_index) = ctx.evm_index {
                    event = event.with_attribute("evm_index", evm_index.to_string());
                    outcome.response.data = Bytes::copy_from_slice(tx.tx_hash.as_slice());
                }
                outcome.response.events.push(event);
            }
            Err(reason) => {
                outcome.response.log = reason.clone();
                outcome.error = Some(TxError::Execution(reason));
            }
        }
        outcome
    }

    fn credit_fee_collector(
        &self,
        scratch: &mut ScratchStore,
        collector: Address,
        amount: &Coins,
    ) -> Result<(), TxError> {
        let mut account = read_account(scratch, &collector).unwrap_or_default();
        account.balance = account
            .balance
            .checked_add(amount.amount_of(DENOM))
            .ok_or_else(|| TxError::Execution("fee collector balance overflow".to_string()))?;
        write_account(scratch, &collector, &account);
        Ok(())
    }
}
