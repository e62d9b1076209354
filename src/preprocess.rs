//! Decoding, classification and stateless validation of a block's raw
//! transactions.
//!
//! Decoding and field checks run on the rayon pool; sender recovery for
//! virtual machine transactions goes through a pooled [`SenderRecoverer`].
//!
//! [`SenderRecoverer`]: crate::recovery::SenderRecoverer

use crate::codec::{tx_hash, NativeLedgerTx, TxKind, TypedTx, VirtualMachineTx};
use crate::recovery::SenderRecoveryPool;
use crate::types::{codes, BlockContext, TxResult};
use crate::vm::intrinsic_gas;
use alloy_primitives::{Address, Bytes, B256, U256};
use rayon::prelude::*;
use std::sync::Arc;
use tracing::debug;

/// A decoded transaction and everything execution needs to know about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreparedBody {
    Native(NativeLedgerTx),
    Vm {
        tx: VirtualMachineTx,
        sender: Address,
        intrinsic_gas: u64,
    },
    /// Failed stateless validation; executes to this result without
    /// touching state.
    Rejected(TxResult),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedTx {
    /// Position in the block.
    pub index: usize,
    pub hash: B256,
    pub raw_len: usize,
    pub gas_wanted: u64,
    pub body: PreparedBody,
}

impl PreparedTx {
    pub fn kind(&self) -> Option<TxKind> {
        match &self.body {
            PreparedBody::Native(_) => Some(TxKind::Native),
            PreparedBody::Vm { .. } => Some(TxKind::VirtualMachine),
            PreparedBody::Rejected(_) => None,
        }
    }

    /// The fee payer.
    pub fn signer(&self) -> Option<Address> {
        match &self.body {
            PreparedBody::Native(tx) => Some(tx.signer),
            PreparedBody::Vm { sender, .. } => Some(*sender),
            PreparedBody::Rejected(_) => None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.body, PreparedBody::Rejected(_))
    }
}

/// Checks a virtual machine transaction's fields against the block.
pub fn validate_vm_tx(ctx: &BlockContext, tx: &VirtualMachineTx) -> Result<u64, TxResult> {
    if tx.chain_id != ctx.chain_id {
        return Err(TxResult::sdk_error(
            codes::INVALID_CHAIN_ID,
            format!("invalid chain id {}, expected {}", tx.chain_id, ctx.chain_id),
        ));
    }
    if tx.max_priority_fee_per_gas > tx.max_fee_per_gas {
        return Err(TxResult::sdk_error(
            codes::INVALID_REQUEST,
            "max priority fee per gas higher than max fee per gas",
        ));
    }
    let fee_overflows = U256::from(tx.gas_limit)
        .checked_mul(tx.max_fee_per_gas)
        .and_then(|fee| fee.checked_add(tx.value))
        .is_none();
    if fee_overflows {
        return Err(TxResult::sdk_error(codes::INVALID_REQUEST, "gas fee and value overflow"));
    }

    let intrinsic = intrinsic_gas(tx);
    if tx.gas_limit < intrinsic {
        return Err(TxResult::sdk_error(
            codes::OUT_OF_GAS,
            format!("gas limit {} below intrinsic gas {intrinsic}", tx.gas_limit),
        ));
    }
    if let Some(max) = ctx.block_max_gas.filter(|max| tx.gas_limit > *max) {
        return Err(TxResult::sdk_error(
            codes::OUT_OF_GAS,
            format!("gas limit {} exceeds block max gas {max}", tx.gas_limit),
        ));
    }
    if tx.max_fee_per_gas < ctx.base_fee {
        return Err(TxResult::sdk_error(
            codes::INSUFFICIENT_FEE,
            format!("max fee per gas {} below base fee {}", tx.max_fee_per_gas, ctx.base_fee),
        ));
    }
    Ok(intrinsic)
}

pub fn validate_native_tx(ctx: &BlockContext, tx: &NativeLedgerTx) -> Result<(), TxResult> {
    if tx.msgs.is_empty() {
        return Err(TxResult::sdk_error(
            codes::INVALID_REQUEST,
            "must contain at least one message",
        ));
    }
    if let Some(max) = ctx.block_max_gas.filter(|max| tx.gas_limit > *max) {
        return Err(TxResult::sdk_error(
            codes::OUT_OF_GAS,
            format!("gas limit {} exceeds block max gas {max}", tx.gas_limit),
        ));
    }
    Ok(())
}

enum Checked {
    Native(NativeLedgerTx),
    Vm(VirtualMachineTx, u64),
    Rejected(TxResult),
}

fn check(ctx: &BlockContext, raw: &[u8]) -> (u64, Checked) {
    let tx = match TypedTx::decode(raw) {
        Ok(tx) => tx,
        Err(err) => return (0, Checked::Rejected(TxResult::sdk_error(codes::TX_DECODE, err.to_string()))),
    };
    let gas_wanted = tx.gas_limit();
    let checked = match tx {
        TypedTx::Native(tx) => match validate_native_tx(ctx, &tx) {
            Ok(()) => Checked::Native(tx),
            Err(result) => Checked::Rejected(result),
        },
        TypedTx::Vm(tx) => match validate_vm_tx(ctx, &tx) {
            Ok(intrinsic) => Checked::Vm(tx, intrinsic),
            Err(result) => Checked::Rejected(result),
        },
    };
    (gas_wanted, checked)
}

/// Turns raw transactions into [`PreparedTx`]s in block order.
pub struct Preprocessor {
    recovery: Arc<SenderRecoveryPool>,
}

impl Preprocessor {
    pub fn new(recovery: Arc<SenderRecoveryPool>) -> Self {
        Self { recovery }
    }

    pub fn prepare(&self, ctx: &BlockContext, txs: &[Bytes]) -> Vec<PreparedTx> {
        let checked: Vec<(u64, Checked)> = txs.par_iter().map(|raw| check(ctx, raw)).collect();

        let mut recoverer = self.recovery.checkout(ctx.height, txs.len());
        for (idx, (_, checked)) in checked.iter().enumerate() {
            if matches!(checked, Checked::Vm(..)) {
                recoverer.recover(idx, txs[idx].clone(), ctx.chain_id);
            }
        }

        let prepared: Vec<PreparedTx> = checked
            .into_iter()
            .enumerate()
            .map(|(index, (gas_wanted, checked))| {
                let body = match checked {
                    Checked::Native(tx) => PreparedBody::Native(tx),
                    Checked::Rejected(result) => PreparedBody::Rejected(result.with_gas(gas_wanted, 0)),
                    Checked::Vm(tx, intrinsic_gas) => {
                        let recovered = match recoverer.get(index) {
                            Some(result) => result.clone(),
                            None => tx.recover_sender(),
                        };
                        match recovered {
                            Ok(sender) => PreparedBody::Vm {
                                tx,
                                sender,
                                intrinsic_gas,
                            },
                            Err(err) => PreparedBody::Rejected(
                                TxResult::sdk_error(codes::UNAUTHORIZED, err.to_string()).with_gas(gas_wanted, 0),
                            ),
                        }
                    }
                };
                PreparedTx {
                    index,
                    hash: tx_hash(&txs[index]),
                    raw_len: txs[index].len(),
                    gas_wanted,
                    body,
                }
            })
            .collect();

        self.recovery.release(recoverer);

        let rejected = prepared.iter().filter(|tx| tx.is_rejected()).count();
        debug!(height = ctx.height, txs = prepared.len(), rejected, "block preprocessed");
        prepared
    }
}
