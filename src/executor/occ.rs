//! Optimistic concurrent executor backed by the `occ-executor` engine.

use super::{panic_result, BatchExecutor, BatchOutcome, ExecutionPath};
use crate::apply::TxApplier;
use crate::preprocess::PreparedTx;
use crate::state::{Key, KvRead, KvStore, Value};
use crate::types::{BlockContext, TxResult};
use occ_executor::{ExecutorConfig, ParallelExecutor, Storage, TransactionTask, TxnView};
use tracing::debug;

struct BaseStorage<'a>(&'a (dyn KvRead + Sync));

impl Storage<Key, Value> for BaseStorage<'_> {
    fn read(&self, key: &Key) -> Option<Value> {
        self.0.get(key)
    }
}

/// A transaction's multi-version view seen as a key/value store.
struct ViewStore<'v, 'a> {
    view: &'v TxnView<'a, Key, Value>,
}

impl KvRead for ViewStore<'_, '_> {
    fn get(&self, key: &[u8]) -> Option<Value> {
        self.view.read(&key.to_vec())
    }
}

impl KvStore for ViewStore<'_, '_> {
    fn set(&mut self, key: Key, value: Value) {
        self.view.write(key, Some(value));
    }

    fn delete(&mut self, key: &[u8]) {
        self.view.write(key.to_vec(), None);
    }
}

struct BatchTask<'a> {
    applier: &'a TxApplier,
    ctx: &'a BlockContext,
    txs: &'a [PreparedTx],
}

impl TransactionTask<Key, Value> for BatchTask<'_> {
    type Output = TxResult;

    fn execute(&self, txn_idx: usize, view: &TxnView<'_, Key, Value>) -> TxResult {
        let mut store = ViewStore { view };
        self.applier.apply(&mut store, self.ctx, &self.txs[txn_idx])
    }

    fn on_panic(&self, txn_idx: usize, message: String) -> TxResult {
        panic_result(&self.txs[txn_idx], &message)
    }
}

pub struct OccExecutor {
    applier: TxApplier,
    engine: ParallelExecutor,
}

impl OccExecutor {
    pub fn new(applier: TxApplier, num_threads: usize) -> Self {
        Self {
            applier,
            engine: ParallelExecutor::new(ExecutorConfig { num_threads }),
        }
    }
}

impl BatchExecutor for OccExecutor {
    fn path(&self) -> ExecutionPath {
        ExecutionPath::Occ
    }

    fn execute_batch(&self, state: &(dyn KvRead + Sync), ctx: &BlockContext, txs: &[PreparedTx]) -> BatchOutcome {
        let task = BatchTask {
            applier: &self.applier,
            ctx,
            txs,
        };
        let result = self.engine.execute_block(txs.len(), &task, &BaseStorage(state));
        debug!(
            height = ctx.height,
            txs = txs.len(),
            executions = result.total_executions,
            elapsed_us = result.duration.as_micros() as u64,
            "occ batch executed"
        );
        BatchOutcome {
            results: result.outputs,
            changes: result.writes.into_iter().collect(),
        }
    }
}
