//! Scripted transaction handler for unit tests.
//!
//! A raw transaction is UTF-8 text `kind;ops;fee;refund` where `kind` is `evm`
//! or `native`, `ops` is a comma-separated list of `r:key`, `w:key=value`,
//! `inc:key`, `d:key`, `ante`, `fail` or `panic`, and `fee`/`refund` are amounts in wei.
//! `inc:key` reads a decimal counter and writes it back incremented, which
//! makes the final state depend on execution order.

use crate::coordinator::TxHandler;
use crate::error::TxError;
use crate::scratch::ScratchStore;
use crate::store::StateStore;
use crate::types::{account_key, Coins, DeliverOutcome, TxContext, TxResponse};
use alloy_primitives::{Address, U256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;

pub(crate) const DENOM: &str = "wei";

#[derive(Debug, Error)]
#[error("malformed script: {0}")]
pub(crate) struct ScriptError(String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Op {
    Read(String),
    Write(String, String),
    Incr(String),
    Delete(String),
    Ante,
    Fail,
    Panic,
}

#[derive(Debug, Clone)]
pub(crate) struct ScriptTx {
    pub evm: bool,
    pub ops: Vec<Op>,
    pub fee: u64,
    pub refund: u64,
}

/// Builds the raw bytes of a scripted transaction.
pub(crate) fn script(kind: &str, ops: &str, fee: u64, refund: u64) -> Vec<u8> {
    format!("{kind};{ops};{fee};{refund}").into_bytes()
}

#[derive(Debug, Default)]
pub(crate) struct ScriptHandler {
    pub deliveries: AtomicUsize,
    /// Artificial execution time, to let workers overlap.
    pub delay: Option<Duration>,
}

impl ScriptHandler {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            deliveries: AtomicUsize::new(0),
            delay: Some(delay),
        }
    }
}

fn parse_op(op: &str) -> Result<Op, ScriptError> {
    match op {
        "ante" => return Ok(Op::Ante),
        "fail" => return Ok(Op::Fail),
        "panic" => return Ok(Op::Panic),
        _ => {}
    }
    let (tag, rest) = op
        .split_once(':')
        .ok_or_else(|| ScriptError(op.to_string()))?;
    match tag {
        "r" => Ok(Op::Read(rest.to_string())),
        "d" => Ok(Op::Delete(rest.to_string())),
        "inc" => Ok(Op::Incr(rest.to_string())),
        "w" => {
            let (key, value) = rest
                .split_once('=')
                .ok_or_else(|| ScriptError(op.to_string()))?;
            Ok(Op::Write(key.to_string(), value.to_string()))
        }
        _ => Err(ScriptError(op.to_string())),
    }
}

impl TxHandler for ScriptHandler {
    type Tx = ScriptTx;
    type Error = ScriptError;

    fn decode(&self, raw: &[u8]) -> Result<ScriptTx, ScriptError> {
        let text = std::str::from_utf8(raw).map_err(|e| ScriptError(e.to_string()))?;
        let parts: Vec<&str> = text.split(';').collect();
        let [kind, ops, fee, refund] = parts.as_slice() else {
            return Err(ScriptError(text.to_string()));
        };
        let evm = match *kind {
            "evm" => true,
            "native" => false,
            other => return Err(ScriptError(other.to_string())),
        };
        let ops = ops
            .split(',')
            .filter(|op| !op.is_empty())
            .map(parse_op)
            .collect::<Result<Vec<_>, _>>()?;
        let fee = fee.parse().map_err(|_| ScriptError(fee.to_string()))?;
        let refund = refund.parse().map_err(|_| ScriptError(refund.to_string()))?;
        Ok(ScriptTx { evm, ops, fee, refund })
    }

    fn fee(&self, tx: &ScriptTx) -> Coins {
        Coins::from_coin(DENOM, U256::from(tx.fee))
    }

    fn is_evm(&self, tx: &ScriptTx) -> bool {
        tx.evm
    }

    fn deliver(&self, tx: &ScriptTx, _ctx: &TxContext, scratch: &mut ScratchStore) -> DeliverOutcome {
        self.deliveries.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let mut outcome = DeliverOutcome {
            response: TxResponse {
                gas_wanted: 100,
                gas_used: 60,
                ..Default::default()
            },
            refund: Some(Coins::from_coin(DENOM, U256::from(tx.refund))),
            ..Default::default()
        };
        for op in &tx.ops {
            match op {
                Op::Read(key) => {
                    scratch.get(key.as_bytes());
                }
                Op::Write(key, value) => scratch.set(key.as_bytes().to_vec(), value.as_bytes().to_vec()),
                Op::Incr(key) => {
                    let current = scratch
                        .get(key.as_bytes())
                        .and_then(|v| String::from_utf8(v).ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(0);
                    scratch.set(key.as_bytes().to_vec(), (current + 1).to_string().into_bytes());
                }
                Op::Delete(key) => scratch.delete(key.as_bytes()),
                Op::Ante => {
                    outcome.error = Some(TxError::Ante("scripted ante failure".into()));
                    return outcome;
                }
                Op::Fail => {
                    outcome.error = Some(TxError::Execution("scripted failure".into()));
                    return outcome;
                }
                Op::Panic => panic!("scripted panic"),
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
        let key = account_key(&collector);
        let current = scratch
            .get(&key)
            .map(|v| U256::from_be_slice(&v))
            .unwrap_or(U256::ZERO);
        let credited = current
            .checked_add(amount.amount_of(DENOM))
            .ok_or_else(|| TxError::Execution("collector balance overflow".into()))?;
        scratch.set(key, credited.to_be_bytes::<32>().to_vec());
        Ok(())
    }
}

/// Balance of the fee collector as written by [`ScriptHandler::credit_fee_collector`].
pub(crate) fn collector_balance(store: &dyn StateStore, collector: &Address) -> U256 {
    store
        .get(&account_key(collector))
        .map(|v| U256::from_be_slice(&v))
        .unwrap_or(U256::ZERO)
}
