//! Per-transaction state transition shared by every execution path.
//!
//! Fees are never credited to the fee collector here; each result carries
//! its `deferred_fee` and [`write_deferred_balances`] credits the batch
//! total afterwards.

use crate::codec::{self, NativeLedgerTx, NativeMsg, VirtualMachineTx};
use crate::dag::AccessOpsProvider;
use crate::error::{DagError, VmError};
use crate::handlers::HandlerRegistry;
use crate::keys::{self, address_id};
use crate::preprocess::{PreparedBody, PreparedTx};
use crate::state::{Branch, KvStore};
use crate::types::{codes, BlockContext, Event, ResourceAccessOperation, TxResult};
use crate::vm::{VirtualMachine, VmMessage, VmOutcome};
use alloy_primitives::{Address, U256};
use std::sync::Arc;

/// Gas charged to a native transaction before its messages.
pub const NATIVE_BASE_GAS: u64 = 1_000;

#[derive(Clone)]
pub struct TxApplier {
    registry: Arc<HandlerRegistry>,
    vm: Arc<dyn VirtualMachine>,
}

impl TxApplier {
    pub fn new(registry: Arc<HandlerRegistry>, vm: Arc<dyn VirtualMachine>) -> Self {
        Self { registry, vm }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn vm(&self) -> &dyn VirtualMachine {
        self.vm.as_ref()
    }

    /// True if the transaction belongs in the prioritized batch.
    pub fn is_prioritized(&self, tx: &PreparedTx) -> bool {
        match &tx.body {
            PreparedBody::Native(native) => self.registry.all_prioritized(&native.msgs),
            _ => false,
        }
    }

    /// Applies one prepared transaction to `state`.
    ///
    /// Every failure is a result code; only the effects the failure mode
    /// keeps (a bumped nonce, a deducted fee) reach `state`.
    pub fn apply<S: KvStore>(&self, state: &mut S, ctx: &BlockContext, tx: &PreparedTx) -> TxResult {
        match &tx.body {
            PreparedBody::Rejected(result) => result.clone(),
            PreparedBody::Native(native) => self.apply_native(state, ctx, native),
            PreparedBody::Vm {
                tx: vm_tx,
                sender,
                intrinsic_gas,
            } => self.apply_vm(state, ctx, vm_tx, *sender, *intrinsic_gas),
        }
    }

    fn apply_vm<S: KvStore>(
        &self,
        state: &mut S,
        ctx: &BlockContext,
        tx: &VirtualMachineTx,
        sender: Address,
        intrinsic_gas: u64,
    ) -> TxResult {
        let gas_limit = tx.gas_limit;
        let nonce = self.vm.get_nonce(&*state, &sender);
        if nonce != tx.nonce {
            return TxResult::sdk_error(
                codes::INVALID_SEQUENCE,
                format!("invalid nonce: expected {nonce}, got {}", tx.nonce),
            )
            .with_gas(gas_limit, 0);
        }
        let Some(next_nonce) = nonce.checked_add(1) else {
            return TxResult::sdk_error(codes::INVALID_SEQUENCE, format!("nonce {nonce} cannot be incremented"))
                .with_gas(gas_limit, 0);
        };

        let balance = self.vm.get_balance(&*state, &sender);
        let max_cost = U256::from(gas_limit)
            .checked_mul(tx.max_fee_per_gas)
            .and_then(|fee| fee.checked_add(tx.value));
        if max_cost.map_or(true, |cost| cost > balance) {
            keys::set_nonce(state, &sender, next_nonce);
            return TxResult::sdk_error(
                codes::INSUFFICIENT_FUNDS,
                format!("insufficient funds: balance {balance}, cost {}", max_cost.unwrap_or(U256::MAX)),
            )
            .with_gas(gas_limit, 0);
        }

        let price = tx
            .max_fee_per_gas
            .min(ctx.base_fee.saturating_add(tx.max_priority_fee_per_gas));
        let gas_cost = U256::from(gas_limit) * price;
        keys::set_balance(state, &sender, balance - gas_cost);
        keys::set_nonce(state, &sender, next_nonce);

        let msg = VmMessage {
            caller: sender,
            to: tx.to,
            value: tx.value,
            data: tx.data.clone(),
            gas_limit,
            nonce,
            intrinsic_gas,
        };

        let mut branch = Branch::new(&*state);
        let outcome = if tx.is_interop() {
            self.run_interop(&mut branch, ctx, &msg)
        } else {
            self.vm.execute(&mut branch, &msg, ctx)
        };
        let changes = branch.into_changes();

        let mut result = match outcome {
            Ok(outcome) if outcome.success => {
                state.apply(changes);
                let gas_used = outcome.gas_used.max(intrinsic_gas).min(gas_limit);
                TxResult {
                    logs: outcome.logs,
                    events: vec![Event::new("evm_tx").attr("sender", sender).attr("gas_used", gas_used)],
                    ..TxResult::default()
                }
                .with_gas(gas_limit, gas_used)
            }
            Ok(outcome) => TxResult::failed(
                codes::EVM_REVERTED,
                codes::EVM_CODESPACE,
                outcome.revert_reason.unwrap_or_else(|| "execution reverted".to_string()),
            )
            .with_gas(gas_limit, outcome.gas_used.max(intrinsic_gas).min(gas_limit)),
            Err(err) => TxResult::failed(codes::EVM_FAILED, codes::EVM_CODESPACE, err.to_string())
                .with_gas(gas_limit, gas_limit),
        };

        let refund = U256::from(gas_limit - result.gas_used) * price;
        if !refund.is_zero() {
            let balance = keys::get_balance(&*state, &sender);
            keys::set_balance(state, &sender, balance.saturating_add(refund));
        }
        result.deferred_fee = U256::from(result.gas_used) * price;
        result.evm_gas_used = result.gas_used;
        result
    }

    /// Dispatches a call to the interop address to the native handler its
    /// data names.
    fn run_interop(
        &self,
        state: &mut dyn KvStore,
        ctx: &BlockContext,
        msg: &VmMessage,
    ) -> Result<VmOutcome, VmError> {
        if !msg.value.is_zero() {
            return Err(VmError::Execution("interop call cannot carry value".into()));
        }
        let native: NativeMsg = codec::decode(&msg.data).map_err(|e| VmError::Execution(e.to_string()))?;
        let handler = self
            .registry
            .get(&native.msg_type)
            .ok_or_else(|| VmError::Execution(format!("unrecognized message type {}", native.msg_type)))?;

        let gas_used = msg.intrinsic_gas.saturating_add(handler.gas_cost());
        match handler.deliver(state, ctx, &msg.caller, &native) {
            Ok(_) => Ok(VmOutcome {
                success: gas_used <= msg.gas_limit,
                gas_used,
                revert_reason: (gas_used > msg.gas_limit).then(|| "out of gas".to_string()),
                ..VmOutcome::default()
            }),
            Err(err) => Ok(VmOutcome {
                success: false,
                gas_used,
                revert_reason: Some(err.log),
                ..VmOutcome::default()
            }),
        }
    }

    fn apply_native<S: KvStore>(&self, state: &mut S, ctx: &BlockContext, tx: &NativeLedgerTx) -> TxResult {
        let gas_limit = tx.gas_limit;
        let mut handlers = Vec::with_capacity(tx.msgs.len());
        for msg in &tx.msgs {
            match self.registry.get(&msg.msg_type) {
                Some(handler) => handlers.push(handler.clone()),
                None => {
                    return TxResult::sdk_error(
                        codes::UNKNOWN_REQUEST,
                        format!("unrecognized message type: {}", msg.msg_type),
                    )
                    .with_gas(gas_limit, 0)
                }
            }
        }

        let balance = keys::get_balance(&*state, &tx.signer);
        let Some(remaining) = balance.checked_sub(tx.fee) else {
            return TxResult::sdk_error(
                codes::INSUFFICIENT_FEE,
                format!("insufficient fee: balance {balance}, fee {}", tx.fee),
            )
            .with_gas(gas_limit, 0);
        };
        keys::set_balance(state, &tx.signer, remaining);

        let gas_used = handlers
            .iter()
            .fold(NATIVE_BASE_GAS, |gas, handler| gas.saturating_add(handler.gas_cost()));
        if gas_used > gas_limit {
            return TxResult {
                deferred_fee: tx.fee,
                ..TxResult::sdk_error(
                    codes::OUT_OF_GAS,
                    format!("out of gas: limit {gas_limit}, used {gas_used}"),
                )
            }
            .with_gas(gas_limit, gas_limit);
        }

        let mut branch = Branch::new(&*state);
        let mut events = Vec::new();
        for (handler, msg) in handlers.iter().zip(&tx.msgs) {
            match handler.deliver(&mut branch, ctx, &tx.signer, msg) {
                Ok(msg_events) => events.extend(msg_events),
                Err(err) => {
                    return TxResult {
                        deferred_fee: tx.fee,
                        ..TxResult::failed(err.code, err.codespace, err.log)
                    }
                    .with_gas(gas_limit, gas_used)
                }
            }
        }
        let changes = branch.into_changes();
        state.apply(changes);

        TxResult {
            events,
            deferred_fee: tx.fee,
            ..TxResult::default()
        }
        .with_gas(gas_limit, gas_used)
    }

    fn native_ops(&self, tx_index: usize, signer: &Address, msgs: &[NativeMsg]) -> Result<Vec<ResourceAccessOperation>, DagError> {
        let mut ops = vec![ResourceAccessOperation::write(keys::BALANCES, address_id(signer))];
        for msg in msgs {
            let Some(handler) = self.registry.get(&msg.msg_type) else {
                continue;
            };
            if !handler.is_schedulable() {
                return Err(DagError::Unschedulable {
                    tx_index,
                    msg_type: msg.msg_type.clone(),
                });
            }
            if let Ok(msg_ops) = handler.access_ops(signer, msg) {
                ops.extend(msg_ops);
            }
        }
        Ok(ops)
    }
}

impl AccessOpsProvider for TxApplier {
    fn access_ops(&self, tx: &PreparedTx) -> Result<Vec<ResourceAccessOperation>, DagError> {
        match &tx.body {
            PreparedBody::Rejected(_) => Ok(Vec::new()),
            PreparedBody::Native(native) => self.native_ops(tx.index, &native.signer, &native.msgs),
            PreparedBody::Vm { tx: vm_tx, sender, .. } => {
                let mut ops = self.vm.access_ops(sender, vm_tx);
                if vm_tx.is_interop() {
                    if let Ok(native) = codec::decode::<NativeMsg>(&vm_tx.data) {
                        ops.extend(self.native_ops(tx.index, sender, std::slice::from_ref(&native))?);
                    }
                }
                Ok(ops)
            }
        }
    }
}

/// Credits the summed deferred fees of `results` to `collector`.
pub fn write_deferred_balances<S: KvStore + ?Sized>(
    state: &mut S,
    collector: &Address,
    results: &[TxResult],
) -> Option<Event> {
    let total = results
        .iter()
        .fold(U256::ZERO, |total, result| total.saturating_add(result.deferred_fee));
    if total.is_zero() {
        return None;
    }
    let balance = keys::get_balance(&*state, collector);
    keys::set_balance(state, collector, balance.saturating_add(total));
    Some(
        Event::new("deferred_balances")
            .attr("recipient", collector)
            .attr("amount", total),
    )
}
