//! Dependency-signalled concurrent executor.
//!
//! Workers claim transactions in ascending index order. A transaction waits
//! on the completion signals of every earlier transaction it has an edge
//! from, runs against the multi-version map, publishes its writes and
//! signals its dependents. Any access outside the transaction's declared
//! operations, any transaction shape the declared operations cannot
//! describe, and any panic abort the whole batch.

use super::{BatchOutcome, ExecutionPath};
use crate::apply::TxApplier;
use crate::dag::{Dag, DependencyGraphBuilder};
use crate::error::DagError;
use crate::keys;
use crate::preprocess::{PreparedBody, PreparedTx};
use crate::state::{ChangeSet, Key, KvRead, KvStore, Value};
use crate::types::{AccessType, BlockContext, ResourceAccessOperation, TxResult};
use occ_executor::{MVHashMap, ReadResult};
use parking_lot::Mutex;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::debug;

/// A transaction's view: its own writes, then earlier transactions' writes,
/// then the batch's base state. Every access is checked against the
/// declared operations.
struct FastView<'a> {
    txn_idx: usize,
    mv: &'a MVHashMap<Key, Value>,
    base: &'a (dyn KvRead + Sync),
    ops: Vec<&'a ResourceAccessOperation>,
    local: ChangeSet,
    violated: Cell<bool>,
}

impl FastView<'_> {
    fn check(&self, access: AccessType, key: &[u8]) {
        let permitted = keys::split_key(key).is_some_and(|(resource, identifier)| {
            self.ops.iter().any(|op| op.permits(access, &resource, identifier))
        });
        if !permitted {
            self.violated.set(true);
        }
    }
}

impl KvRead for FastView<'_> {
    fn get(&self, key: &[u8]) -> Option<Value> {
        self.check(AccessType::Read, key);
        if let Some(value) = self.local.get(key) {
            return value.clone();
        }
        match self.mv.read(&key.to_vec(), self.txn_idx) {
            ReadResult::Versioned(_, value) => value,
            ReadResult::Storage => self.base.get(key),
        }
    }
}

impl KvStore for FastView<'_> {
    fn set(&mut self, key: Key, value: Value) {
        self.check(AccessType::Write, &key);
        self.local.insert(key, Some(value));
    }

    fn delete(&mut self, key: &[u8]) {
        self.check(AccessType::Write, key);
        self.local.insert(key.to_vec(), None);
    }
}

/// Only plain virtual machine calls and pre-rejected transactions are
/// fully described by their declared operations.
fn is_supported(tx: &PreparedTx) -> bool {
    match &tx.body {
        PreparedBody::Vm { tx, .. } => !tx.is_interop() && !tx.is_create(),
        PreparedBody::Rejected(_) => true,
        PreparedBody::Native(_) => false,
    }
}

pub struct FastExecutor {
    applier: TxApplier,
    builder: DependencyGraphBuilder,
    num_threads: usize,
}

impl FastExecutor {
    pub fn new(applier: TxApplier, num_threads: usize) -> Self {
        let builder = DependencyGraphBuilder::new(Arc::new(applier.clone()));
        Self {
            applier,
            builder,
            num_threads,
        }
    }

    pub fn path(&self) -> ExecutionPath {
        ExecutionPath::Fast
    }

    pub fn build_graph(&self, ctx: &BlockContext, txs: &[PreparedTx]) -> Result<Dag, DagError> {
        self.builder.build(ctx, txs)
    }

    /// Runs `txs` under the wait-for edges of `dag`. Returns an aborted
    /// outcome when the batch has to be redone on a safer path.
    pub fn execute_with_graph(
        &self,
        state: &(dyn KvRead + Sync),
        ctx: &BlockContext,
        txs: &[PreparedTx],
        dag: &Dag,
    ) -> BatchOutcome {
        let num_txs = txs.len();
        if num_txs == 0 {
            return BatchOutcome::default();
        }
        if let Some(tx) = txs.iter().find(|tx| !is_supported(tx)) {
            debug!(height = ctx.height, tx_index = tx.index, "unsupported transaction shape for fast path");
            return BatchOutcome::aborted(num_txs);
        }

        let start = Instant::now();
        let mut maps = dag.build_completion_signal_maps();
        let signals: Vec<_> = (0..num_txs)
            .map(|idx| Mutex::new(Some((maps.take_blocking(idx), maps.take_completion(idx)))))
            .collect();
        let results: Vec<Mutex<Option<TxResult>>> = (0..num_txs).map(|_| Mutex::new(None)).collect();
        let next = AtomicUsize::new(0);
        let aborted = AtomicBool::new(false);
        let mv = MVHashMap::new();

        let num_threads = self.num_threads.clamp(1, num_txs);
        thread::scope(|scope| {
            for _ in 0..num_threads {
                scope.spawn(|| loop {
                    let idx = next.fetch_add(1, Ordering::SeqCst);
                    if idx >= num_txs {
                        break;
                    }
                    let Some((blocking, completion)) = signals[idx].lock().take() else {
                        continue;
                    };

                    let unblocked = blocking.iter().all(|signal| signal.wait());
                    let result = if !unblocked || aborted.load(Ordering::SeqCst) {
                        TxResult::abort()
                    } else {
                        self.run_one(state, ctx, txs, dag, &mv, idx)
                    };
                    if result.is_abort() {
                        aborted.store(true, Ordering::SeqCst);
                    }
                    for signal in &completion {
                        signal.signal();
                    }
                    *results[idx].lock() = Some(result);
                });
            }
        });

        if aborted.load(Ordering::SeqCst) {
            debug!(height = ctx.height, txs = num_txs, "fast path aborted batch");
            return BatchOutcome::aborted(num_txs);
        }

        let results = results
            .into_iter()
            .map(|slot| slot.into_inner().unwrap_or_else(TxResult::abort))
            .collect();
        debug!(
            height = ctx.height,
            txs = num_txs,
            edges = dag.edges().len(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "fast batch executed"
        );
        BatchOutcome {
            results,
            changes: mv.final_writes().into_iter().collect(),
        }
    }

    fn run_one(
        &self,
        state: &(dyn KvRead + Sync),
        ctx: &BlockContext,
        txs: &[PreparedTx],
        dag: &Dag,
        mv: &MVHashMap<Key, Value>,
        idx: usize,
    ) -> TxResult {
        let ops = dag
            .nodes_for_tx(idx)
            .iter()
            .filter_map(|&node| dag.node(node))
            .map(|node| &node.access_op)
            .collect();
        let mut view = FastView {
            txn_idx: idx,
            mv,
            base: state,
            ops,
            local: ChangeSet::new(),
            violated: Cell::new(false),
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.applier.apply(&mut view, ctx, &txs[idx])));
        match outcome {
            Ok(_) if view.violated.get() => {
                debug!(height = ctx.height, tx_index = txs[idx].index, "undeclared state access");
                TxResult::abort()
            }
            Ok(result) => {
                for (key, value) in view.local {
                    mv.write(key, idx, 0, value);
                }
                result
            }
            Err(_) => TxResult::abort(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, NativeMsg, INTEROP_ADDRESS};
    use crate::executor::test_support::*;
    use crate::handlers::{MsgSend, MSG_SEND};
    use alloy_primitives::{Bytes, U256};

    #[test]
    fn test_fast_matches_sequential() {
        let state = funded(16);
        let executor = FastExecutor::new(applier(), 4);
        for seed in 0..5 {
            let txs = random_transfers(seed, 100, 16);
            let dag = executor.build_graph(&ctx(), &txs).expect("transfers are schedulable");
            let outcome = executor.execute_with_graph(&state, &ctx(), &txs, &dag);
            let (results, changes) = sequential_reference(&*state, &txs);

            assert!(!outcome.is_aborted());
            assert_eq!(outcome.results, results, "seed {seed}");
            assert_eq!(outcome.changes, changes, "seed {seed}");
        }
    }

    #[test]
    fn test_interop_call_aborts_batch() {
        let state = funded(2);
        let executor = FastExecutor::new(applier(), 2);
        let mut txs = vec![transfer(0, 0, 1, 0, 5), transfer(1, 1, 0, 0, 5)];
        if let PreparedBody::Vm { tx, .. } = &mut txs[1].body {
            let msg = NativeMsg::new(MSG_SEND, &MsgSend { to: account(0), amount: U256::from(1) }).expect("encodes");
            tx.to = Some(INTEROP_ADDRESS);
            tx.value = U256::ZERO;
            tx.data = Bytes::from(codec::encode(&msg).expect("encodes"));
        }

        let dag = executor.build_graph(&ctx(), &txs).expect("schedulable");
        let outcome = executor.execute_with_graph(&state, &ctx(), &txs, &dag);
        assert!(outcome.is_aborted());
        assert!(outcome.changes.is_empty());
        assert!(outcome.results.iter().all(TxResult::is_abort));
    }

    #[test]
    fn test_undeclared_access_aborts_batch() {
        let state = funded(2);
        let executor = FastExecutor::new(applier(), 2);
        let txs = vec![transfer(0, 0, 1, 0, 5)];

        // A graph whose only declared operation is the commit.
        let mut dag = Dag::new();
        dag.add_node_with_dependency(0, ResourceAccessOperation::commit());
        let outcome = executor.execute_with_graph(&state, &ctx(), &txs, &dag);
        assert!(outcome.is_aborted());
    }
}
