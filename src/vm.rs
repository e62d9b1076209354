//! Virtual machine interface and the built-in value-transfer machine.

use crate::codec::VirtualMachineTx;
use crate::error::VmError;
use crate::keys::{self, address_id};
use crate::state::{KvRead, KvStore};
use crate::types::{BlockContext, ResourceAccessOperation};
use alloy_primitives::{keccak256, Address, Bytes, Log, U256};

pub const TX_GAS: u64 = 21_000;
pub const TX_CREATE_GAS: u64 = 32_000;
pub const TX_DATA_ZERO_GAS: u64 = 4;
pub const TX_DATA_NON_ZERO_GAS: u64 = 16;

/// Gas charged before any execution.
pub fn intrinsic_gas(tx: &VirtualMachineTx) -> u64 {
    let zeros = tx.data.iter().filter(|&&b| b == 0).count() as u64;
    let non_zeros = tx.data.len() as u64 - zeros;
    let base = if tx.is_create() { TX_GAS + TX_CREATE_GAS } else { TX_GAS };
    base.saturating_add(zeros.saturating_mul(TX_DATA_ZERO_GAS))
        .saturating_add(non_zeros.saturating_mul(TX_DATA_NON_ZERO_GAS))
}

/// A message for the machine, after gas has been bought and the nonce bumped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmMessage {
    pub caller: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
    pub gas_limit: u64,
    /// The transaction's nonce (before the bump).
    pub nonce: u64,
    pub intrinsic_gas: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VmOutcome {
    pub success: bool,
    pub gas_used: u64,
    pub logs: Vec<Log>,
    pub output: Bytes,
    pub revert_reason: Option<String>,
}

/// The pluggable interpreter.
///
/// `execute` runs on a branch the caller discards when the outcome is not a
/// success, so implementations may write freely.
pub trait VirtualMachine: Send + Sync {
    fn name(&self) -> &'static str;

    fn execute(&self, state: &mut dyn KvStore, msg: &VmMessage, block: &BlockContext) -> Result<VmOutcome, VmError>;

    /// Resources a transaction from `sender` touches.
    fn access_ops(&self, sender: &Address, tx: &VirtualMachineTx) -> Vec<ResourceAccessOperation> {
        let mut ops = vec![
            ResourceAccessOperation::write(keys::NONCES, address_id(sender)),
            ResourceAccessOperation::write(keys::BALANCES, address_id(sender)),
        ];
        if let Some(to) = tx.to.filter(|to| to != sender) {
            ops.push(ResourceAccessOperation::write(keys::BALANCES, address_id(&to)));
        }
        ops
    }

    fn get_nonce(&self, state: &dyn KvRead, address: &Address) -> u64 {
        keys::get_nonce(state, address)
    }

    fn get_balance(&self, state: &dyn KvRead, address: &Address) -> U256 {
        keys::get_balance(state, address)
    }
}

/// Moves value between accounts and emits a `Transfer` log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferVm;

impl TransferVm {
    fn transfer_log(from: Address, to: Address, value: U256) -> Log {
        let topic = keccak256("Transfer(address,address,uint256)");
        Log::new_unchecked(
            to,
            vec![topic, from.into_word(), to.into_word()],
            Bytes::copy_from_slice(&value.to_be_bytes::<32>()),
        )
    }
}

impl VirtualMachine for TransferVm {
    fn name(&self) -> &'static str {
        "transfer"
    }

    fn execute(&self, state: &mut dyn KvStore, msg: &VmMessage, _block: &BlockContext) -> Result<VmOutcome, VmError> {
        let to = msg.to.ok_or(VmError::CreateUnsupported)?;

        let from_balance = keys::get_balance(&*state, &msg.caller);
        let remaining = from_balance
            .checked_sub(msg.value)
            .ok_or(VmError::InsufficientBalance)?;
        keys::set_balance(state, &msg.caller, remaining);
        let to_balance = keys::get_balance(&*state, &to);
        keys::set_balance(state, &to, to_balance.saturating_add(msg.value));

        Ok(VmOutcome {
            success: true,
            gas_used: msg.intrinsic_gas,
            logs: vec![Self::transfer_log(msg.caller, to, msg.value)],
            ..Default::default()
        })
    }
}
