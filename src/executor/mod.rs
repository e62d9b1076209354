//! Batch execution strategies.
//!
//! Every strategy turns an ordered batch of prepared transactions into
//! per-transaction results and one change set, and every strategy must
//! produce exactly what the sequential strategy produces. The
//! [`ExecutionPathSelector`] picks among them per batch.

mod fast;
mod occ;
mod selector;
mod sequential;

pub use fast::FastExecutor;
pub use occ::OccExecutor;
pub use selector::ExecutionPathSelector;
pub use sequential::SequentialExecutor;

use crate::preprocess::PreparedTx;
use crate::state::{ChangeSet, KvRead};
use crate::types::{codes, BlockContext, TxResult};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionPath {
    /// Dependency-signalled concurrent execution.
    Fast,
    /// Optimistic concurrent execution with validation.
    Occ,
    Sequential,
}

impl ExecutionPath {
    pub fn name(&self) -> &'static str {
        match self {
            ExecutionPath::Fast => "fast",
            ExecutionPath::Occ => "occ",
            ExecutionPath::Sequential => "sequential",
        }
    }
}

impl fmt::Display for ExecutionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Results of one batch, in batch order, and its combined writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub results: Vec<TxResult>,
    pub changes: ChangeSet,
}

impl BatchOutcome {
    /// An outcome asking for the whole batch to be redone.
    pub fn aborted(num_txs: usize) -> Self {
        Self {
            results: vec![TxResult::abort(); num_txs],
            changes: ChangeSet::new(),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.results.iter().any(TxResult::is_abort)
    }
}

pub trait BatchExecutor: Send + Sync {
    fn path(&self) -> ExecutionPath;

    fn execute_batch(&self, state: &(dyn KvRead + Sync), ctx: &BlockContext, txs: &[PreparedTx]) -> BatchOutcome;
}

/// Result recorded for a transaction whose execution panicked.
pub(crate) fn panic_result(tx: &PreparedTx, message: &str) -> TxResult {
    TxResult::sdk_error(codes::PANIC, format!("panic executing transaction: {message}")).with_gas(tx.gas_wanted, 0)
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::apply::TxApplier;
    use crate::codec::VirtualMachineTx;
    use crate::handlers::HandlerRegistry;
    use crate::keys;
    use crate::preprocess::{PreparedBody, PreparedTx};
    use crate::state::{Branch, ChangeSet, MemStore, Snapshot, StateStore};
    use crate::types::{BlockContext, TxResult};
    use crate::vm::TransferVm;
    use alloy_primitives::{Address, Bytes, B256, U256};
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::sync::Arc;

    pub fn applier() -> TxApplier {
        TxApplier::new(Arc::new(HandlerRegistry::standard()), Arc::new(TransferVm))
    }

    pub fn ctx() -> BlockContext {
        BlockContext {
            height: 1,
            hash: B256::ZERO,
            time: 0,
            chain_id: 1,
            base_fee: U256::from(1),
            block_max_gas: None,
            proposer: Address::ZERO,
        }
    }

    pub fn account(i: usize) -> Address {
        Address::with_last_byte(i as u8 + 1)
    }

    /// Committed state funding `num_accounts` accounts.
    pub fn funded(num_accounts: usize) -> Arc<dyn Snapshot> {
        let genesis = (0..num_accounts)
            .map(|i| (keys::balance_key(&account(i)), keys::encode_u256(U256::from(10_000_000u64))))
            .collect();
        MemStore::with_genesis(genesis).snapshot()
    }

    pub fn transfer(index: usize, from: usize, to: usize, nonce: u64, value: u64) -> PreparedTx {
        PreparedTx {
            index,
            hash: B256::with_last_byte(index as u8),
            raw_len: 100,
            gas_wanted: 21_000,
            body: PreparedBody::Vm {
                tx: VirtualMachineTx {
                    chain_id: 1,
                    nonce,
                    gas_limit: 21_000,
                    max_fee_per_gas: U256::from(2),
                    max_priority_fee_per_gas: U256::from(1),
                    to: Some(account(to)),
                    value: U256::from(value),
                    data: Bytes::new(),
                    signature: Vec::new(),
                },
                sender: account(from),
                intrinsic_gas: 21_000,
            },
        }
    }

    /// Random transfers among `num_accounts` accounts with correct nonces.
    pub fn random_transfers(seed: u64, num_txs: usize, num_accounts: usize) -> Vec<PreparedTx> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut nonces = vec![0u64; num_accounts];
        (0..num_txs)
            .map(|index| {
                let from = rng.gen_range(0..num_accounts);
                let to = rng.gen_range(0..num_accounts);
                let nonce = nonces[from];
                nonces[from] += 1;
                transfer(index, from, to, nonce, rng.gen_range(1..1_000))
            })
            .collect()
    }

    /// One-by-one application of `txs` on a single branch.
    pub fn sequential_reference(state: &dyn Snapshot, txs: &[PreparedTx]) -> (Vec<TxResult>, ChangeSet) {
        let applier = applier();
        let mut branch = Branch::new(state);
        let results = txs.iter().map(|tx| applier.apply(&mut branch, &ctx(), tx)).collect();
        (results, branch.into_changes())
    }
}
