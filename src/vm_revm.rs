//! revm-backed virtual machine.
//!
//! Each message runs in a fresh `CacheDB` seeded with the caller and
//! recipient accounts from the ledger; their balances are written back
//! after execution. Gas is bought by the caller of the machine, so the
//! message runs with a zero gas price.

use crate::error::VmError;
use crate::keys;
use crate::state::KvStore;
use crate::types::BlockContext;
use crate::vm::{VirtualMachine, VmMessage, VmOutcome};
use revm::{
    context::TxEnv,
    database::{CacheDB, EmptyDB},
    primitives::{TxKind, KECCAK_EMPTY},
    state::AccountInfo,
    Context, Database, ExecuteCommitEvm, MainBuilder, MainContext,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct RevmVm;

impl VirtualMachine for RevmVm {
    fn name(&self) -> &'static str {
        "revm"
    }

    fn execute(&self, state: &mut dyn KvStore, msg: &VmMessage, _block: &BlockContext) -> Result<VmOutcome, VmError> {
        let to = msg.to.ok_or(VmError::CreateUnsupported)?;

        let mut db = CacheDB::new(EmptyDB::default());
        db.insert_account_info(
            msg.caller,
            AccountInfo {
                balance: keys::get_balance(&*state, &msg.caller),
                nonce: msg.nonce,
                code_hash: KECCAK_EMPTY,
                code: None,
            },
        );
        if to != msg.caller {
            db.insert_account_info(
                to,
                AccountInfo {
                    balance: keys::get_balance(&*state, &to),
                    nonce: keys::get_nonce(&*state, &to),
                    code_hash: KECCAK_EMPTY,
                    code: None,
                },
            );
        }

        let mut evm = Context::mainnet().with_db(db).build_mainnet();
        let tx_env = TxEnv {
            caller: msg.caller,
            kind: TxKind::Call(to),
            value: msg.value,
            data: msg.data.clone(),
            gas_limit: msg.gas_limit,
            gas_price: 0,
            nonce: msg.nonce,
            chain_id: None,
            ..Default::default()
        };

        let result = evm
            .transact_commit(tx_env)
            .map_err(|e| VmError::Execution(format!("{e:?}")))?;

        let mut db = evm.ctx.journaled_state.database;
        for address in [msg.caller, to] {
            if let Ok(Some(info)) = db.basic(address) {
                keys::set_balance(state, &address, info.balance);
            }
        }

        Ok(VmOutcome {
            success: result.is_success(),
            gas_used: result.gas_used(),
            logs: result.logs().to_vec(),
            output: result.output().cloned().unwrap_or_default(),
            revert_reason: (!result.is_success()).then(|| "execution reverted".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Branch, MemSnapshot};
    use alloy_primitives::{Address, Bytes, U256};

    #[test]
    fn test_revm_value_transfer() {
        let base = MemSnapshot::default();
        let mut state = Branch::new(&base);
        let alice = Address::repeat_byte(1);
        let bob = Address::repeat_byte(2);
        keys::set_balance(&mut state, &alice, U256::from(1_000_000));

        let msg = VmMessage {
            caller: alice,
            to: Some(bob),
            value: U256::from(500),
            data: Bytes::new(),
            gas_limit: 21_000,
            nonce: 0,
            intrinsic_gas: 21_000,
        };
        let block = BlockContext {
            height: 1,
            hash: Default::default(),
            time: 0,
            chain_id: 1,
            base_fee: U256::ZERO,
            block_max_gas: None,
            proposer: Address::ZERO,
        };

        let outcome = RevmVm.execute(&mut state, &msg, &block).expect("revm executes");
        assert!(outcome.success);
        assert_eq!(outcome.gas_used, 21_000);
        assert_eq!(keys::get_balance(&state, &bob), U256::from(500));
        assert_eq!(keys::get_balance(&state, &alice), U256::from(999_500));
    }
}
