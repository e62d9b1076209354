//! Per-batch choice of execution strategy.

use super::{BatchExecutor, BatchOutcome, ExecutionPath, FastExecutor, OccExecutor, SequentialExecutor};
use crate::apply::TxApplier;
use crate::config::ExecutionConfig;
use crate::preprocess::PreparedTx;
use crate::state::KvRead;
use crate::types::BlockContext;
use tracing::{debug, info, warn};

/// Decides the strategy from the configuration flags only, so every
/// validator running the same configuration takes the same path.
///
/// | giga | occ | first attempt | on fast-path abort |
/// |------|-----|---------------|--------------------|
/// | on   | on  | fast          | occ                |
/// | on   | off | fast          | sequential         |
/// | off  | on  | occ           |                    |
/// | off  | off | sequential    |                    |
///
/// A batch whose dependency graph cannot be built goes straight to the
/// sequential path. Fallbacks always redo the whole batch.
pub struct ExecutionPathSelector {
    giga_enabled: bool,
    occ_enabled: bool,
    fast: FastExecutor,
    occ: OccExecutor,
    sequential: SequentialExecutor,
}

impl ExecutionPathSelector {
    pub fn new(config: &ExecutionConfig, applier: TxApplier) -> Self {
        Self {
            giga_enabled: config.giga_enabled,
            occ_enabled: config.occ_enabled,
            fast: FastExecutor::new(applier.clone(), config.concurrency_workers),
            occ: OccExecutor::new(applier.clone(), config.concurrency_workers),
            sequential: SequentialExecutor::new(applier),
        }
    }

    /// The path a batch is attempted on first.
    pub fn primary_path(&self) -> ExecutionPath {
        if self.giga_enabled {
            ExecutionPath::Fast
        } else if self.occ_enabled {
            ExecutionPath::Occ
        } else {
            ExecutionPath::Sequential
        }
    }

    fn fallback(&self) -> &dyn BatchExecutor {
        if self.occ_enabled {
            &self.occ
        } else {
            &self.sequential
        }
    }

    /// Executes `txs` and reports the path whose outcome was kept.
    pub fn execute(
        &self,
        state: &(dyn KvRead + Sync),
        ctx: &BlockContext,
        txs: &[PreparedTx],
    ) -> (BatchOutcome, ExecutionPath) {
        match self.primary_path() {
            ExecutionPath::Fast => self.execute_fast(state, ctx, txs),
            ExecutionPath::Occ => (self.occ.execute_batch(state, ctx, txs), ExecutionPath::Occ),
            ExecutionPath::Sequential => (self.sequential.execute_batch(state, ctx, txs), ExecutionPath::Sequential),
        }
    }

    fn execute_fast(
        &self,
        state: &(dyn KvRead + Sync),
        ctx: &BlockContext,
        txs: &[PreparedTx],
    ) -> (BatchOutcome, ExecutionPath) {
        let dag = match self.fast.build_graph(ctx, txs) {
            Ok(dag) => dag,
            Err(err) => {
                info!(height = ctx.height, txs = txs.len(), %err, "dependency graph unavailable, executing sequentially");
                return (self.sequential.execute_batch(state, ctx, txs), ExecutionPath::Sequential);
            }
        };

        let outcome = self.fast.execute_with_graph(state, ctx, txs, &dag);
        if !outcome.is_aborted() {
            debug!(height = ctx.height, txs = txs.len(), path = %self.fast.path(), "batch executed");
            return (outcome, ExecutionPath::Fast);
        }

        let fallback = self.fallback();
        warn!(height = ctx.height, txs = txs.len(), fallback = %fallback.path(), "fast path aborted, redoing batch");
        (fallback.execute_batch(state, ctx, txs), fallback.path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{NativeLedgerTx, NativeMsg};
    use crate::handlers::{MsgSubmitProposal, MSG_SUBMIT_PROPOSAL};
    use crate::executor::test_support::*;
    use crate::preprocess::PreparedBody;
    use alloy_primitives::{B256, U256};

    fn config(giga_enabled: bool, occ_enabled: bool) -> ExecutionConfig {
        ExecutionConfig {
            giga_enabled,
            occ_enabled,
            concurrency_workers: 4,
            ..ExecutionConfig::minimal()
        }
    }

    #[test]
    fn test_all_flag_combinations_agree() {
        let state = funded(12);
        let txs = random_transfers(7, 80, 12);
        let (expected, changes) = sequential_reference(&*state, &txs);

        for (giga, occ, path) in [
            (true, true, ExecutionPath::Fast),
            (true, false, ExecutionPath::Fast),
            (false, true, ExecutionPath::Occ),
            (false, false, ExecutionPath::Sequential),
        ] {
            let selector = ExecutionPathSelector::new(&config(giga, occ), applier());
            assert_eq!(selector.primary_path(), path);

            let (outcome, taken) = selector.execute(&state, &ctx(), &txs);
            assert_eq!(taken, path, "giga={giga} occ={occ}");
            assert_eq!(outcome.results, expected);
            assert_eq!(outcome.changes, changes);
        }
    }

    #[test]
    fn test_abort_redoes_whole_batch() {
        let state = funded(4);
        let mut txs = random_transfers(3, 10, 4);
        // A native transaction the fast path cannot run.
        txs.push(PreparedTx {
            index: 10,
            hash: B256::repeat_byte(10),
            raw_len: 10,
            gas_wanted: 10_000,
            body: PreparedBody::Native(NativeLedgerTx {
                signer: account(0),
                fee: U256::from(10),
                gas_limit: 10_000,
                msgs: Vec::new(),
            }),
        });
        let (expected, changes) = sequential_reference(&*state, &txs);

        for (occ, fallback) in [(true, ExecutionPath::Occ), (false, ExecutionPath::Sequential)] {
            let selector = ExecutionPathSelector::new(&config(true, occ), applier());
            let (outcome, taken) = selector.execute(&state, &ctx(), &txs);
            assert_eq!(taken, fallback);
            assert!(!outcome.is_aborted());
            assert_eq!(outcome.results, expected);
            assert_eq!(outcome.changes, changes);
        }
    }

    #[test]
    fn test_unschedulable_batch_runs_sequentially() {
        let state = funded(4);
        let mut txs = random_transfers(9, 10, 4);
        let proposal = NativeMsg::new(
            MSG_SUBMIT_PROPOSAL,
            &MsgSubmitProposal {
                id: 7,
                title: "raise limits".into(),
            },
        )
        .expect("encodes");
        txs.insert(
            4,
            PreparedTx {
                index: 4,
                hash: B256::repeat_byte(44),
                raw_len: 40,
                gas_wanted: 50_000,
                body: PreparedBody::Native(NativeLedgerTx {
                    signer: account(1),
                    fee: U256::from(10),
                    gas_limit: 50_000,
                    msgs: vec![proposal],
                }),
            },
        );
        for (i, tx) in txs.iter_mut().enumerate() {
            tx.index = i;
        }
        let (expected, changes) = sequential_reference(&*state, &txs);
        assert!(expected[4].is_ok(), "{:?}", expected[4]);

        for occ in [true, false] {
            let selector = ExecutionPathSelector::new(&config(true, occ), applier());
            let (outcome, taken) = selector.execute(&state, &ctx(), &txs);
            assert_eq!(taken, ExecutionPath::Sequential, "occ={occ}");
            assert_eq!(outcome.results, expected);
            assert_eq!(outcome.changes, changes);
        }
    }
}
