//! Sequential batch executor.
//!
//! The baseline every other strategy must reproduce: transactions are
//! applied one at a time, in batch order, each on its own branch over the
//! batch so that a panicking transaction leaves no writes behind.

use super::{panic_result, BatchExecutor, BatchOutcome, ExecutionPath};
use crate::apply::TxApplier;
use crate::preprocess::PreparedTx;
use crate::state::{Branch, KvRead, KvStore};
use crate::types::BlockContext;
use occ_executor::panic_message;
use std::panic::{self, AssertUnwindSafe};
use tracing::warn;

#[derive(Clone)]
pub struct SequentialExecutor {
    applier: TxApplier,
}

impl SequentialExecutor {
    pub fn new(applier: TxApplier) -> Self {
        Self { applier }
    }
}

impl BatchExecutor for SequentialExecutor {
    fn path(&self) -> ExecutionPath {
        ExecutionPath::Sequential
    }

    fn execute_batch(&self, state: &(dyn KvRead + Sync), ctx: &BlockContext, txs: &[PreparedTx]) -> BatchOutcome {
        let mut batch = Branch::new(state);
        let mut results = Vec::with_capacity(txs.len());

        for tx in txs {
            let mut tx_state = Branch::new(&batch);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.applier.apply(&mut tx_state, ctx, tx)));
            let changes = tx_state.into_changes();
            match outcome {
                Ok(result) => {
                    batch.apply(changes);
                    results.push(result);
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    warn!(height = ctx.height, tx_index = tx.index, %message, "transaction panicked");
                    results.push(panic_result(tx, &message));
                }
            }
        }

        BatchOutcome {
            results,
            changes: batch.into_changes(),
        }
    }
}
