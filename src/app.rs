//! Consensus-facing application lifecycle.
//!
//! `process_proposal` starts speculative execution of a proposal;
//! `finalize_block` reconciles it or executes synchronously, stages the
//! block's writes and returns the working hash; `commit` persists them.
//! The legacy `begin_block`/`deliver_tx`/`end_block` calls execute one
//! transaction at a time.

use crate::apply::write_deferred_balances;
use crate::codec::TypedTx;
use crate::error::{AppError, BlockError};
use crate::executor::panic_result;
use crate::processor::{BlockProcessor, ProcessedBlock};
use crate::receipts::{build_receipts, ReceiptStore};
use crate::speculation::{SpeculationController, SpeculationCounts};
use crate::state::{Branch, ChangeSet, KvStore, Snapshot, StateStore};
use crate::types::{BlockContext, BlockHeader, ConsensusParams, EndBlockResponse, Event, TxResult, ValidatorUpdate};
use alloy_primitives::{Bytes, B256};
use occ_executor::panic_message;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Supplies synthetic transactions in place of the mempool's.
pub trait ProposalSource: Send + Sync {
    fn generate(&self, height: u64, max_bytes: usize) -> Vec<Bytes>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxAction {
    Unmodified,
    Generated,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRecord {
    pub action: TxAction,
    pub tx: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalStatus {
    Accept,
    Reject,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalizeBlockResponse {
    pub events: Vec<Event>,
    pub tx_results: Vec<TxResult>,
    pub validator_updates: Vec<ValidatorUpdate>,
    pub consensus_param_updates: Option<ConsensusParams>,
    pub app_hash: B256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitResponse {
    pub height: u64,
    pub app_hash: B256,
}

struct FinalizedBlock {
    height: u64,
    hash: B256,
    response: FinalizeBlockResponse,
    committed: bool,
}

struct DeliverState {
    header: BlockHeader,
    ctx: BlockContext,
    snapshot: Arc<dyn Snapshot>,
    changes: ChangeSet,
    events: Vec<Event>,
    tx_results: Vec<TxResult>,
    evm_gas_used: u64,
}

pub struct Application {
    processor: Arc<BlockProcessor>,
    store: Arc<dyn StateStore>,
    receipts: Arc<dyn ReceiptStore>,
    speculation: SpeculationController,
    proposal_source: Option<Arc<dyn ProposalSource>>,
    finalized: Mutex<Option<FinalizedBlock>>,
    deliver: Mutex<Option<DeliverState>>,
}

impl Application {
    pub fn new(processor: BlockProcessor, store: Arc<dyn StateStore>, receipts: Arc<dyn ReceiptStore>) -> Self {
        let timeout = processor.config().optimistic_timeout();
        Self {
            processor: Arc::new(processor),
            store,
            receipts,
            speculation: SpeculationController::new(timeout),
            proposal_source: None,
            finalized: Mutex::new(None),
            deliver: Mutex::new(None),
        }
    }

    pub fn with_proposal_source(mut self, source: Arc<dyn ProposalSource>) -> Self {
        self.proposal_source = Some(source);
        self
    }

    pub fn processor(&self) -> &Arc<BlockProcessor> {
        &self.processor
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn speculation_stats(&self) -> SpeculationCounts {
        self.speculation.stats()
    }

    /// Orders the proposal. With a proposal source installed the mempool's
    /// transactions are replaced by generated ones.
    pub fn prepare_proposal(&self, height: u64, txs: Vec<Bytes>, max_bytes: usize) -> Vec<TxRecord> {
        if let Some(source) = &self.proposal_source {
            let mut records: Vec<TxRecord> = source
                .generate(height, max_bytes)
                .into_iter()
                .map(|tx| TxRecord {
                    action: TxAction::Generated,
                    tx,
                })
                .collect();
            debug!(height, generated = records.len(), "proposal generated");
            records.extend(txs.into_iter().map(|tx| TxRecord {
                action: TxAction::Removed,
                tx,
            }));
            return records;
        }

        let mut total = 0usize;
        txs.into_iter()
            .map(|tx| {
                let action = if total.saturating_add(tx.len()) <= max_bytes {
                    total += tx.len();
                    TxAction::Unmodified
                } else {
                    TxAction::Removed
                };
                TxRecord { action, tx }
            })
            .collect()
    }

    /// Checks the proposal's total gas and starts executing it
    /// speculatively.
    pub fn process_proposal(&self, header: &BlockHeader, txs: &[Bytes]) -> ProposalStatus {
        if let Some(max_gas) = self.processor.config().max_gas() {
            let total_gas = txs.iter().try_fold(0u64, |total, raw| match TypedTx::decode(raw) {
                Ok(tx) => total.checked_add(tx.gas_limit()),
                Err(_) => Some(total),
            });
            if total_gas.map_or(true, |total| total > max_gas) {
                info!(height = header.height, ?total_gas, max_gas, "proposal exceeds block gas limit");
                return ProposalStatus::Reject;
            }
        }

        if let Some(upgrade) = self.processor.hooks().upgrade_pending(header.height) {
            info!(height = header.height, %upgrade, "upgrade pending, not speculating");
            self.speculation.mark_skipped(header.height, header.hash);
            return ProposalStatus::Accept;
        }

        let processor = self.processor.clone();
        let snapshot = self.store.snapshot();
        let job_header = header.clone();
        let job_txs = txs.to_vec();
        self.speculation.propose(header.height, header.hash, move || {
            processor.process_block(&*snapshot, &job_header, &job_txs)
        });
        ProposalStatus::Accept
    }

    /// Executes the decided block, reusing a speculative result when it
    /// matches. A repeated call for the same block returns the same
    /// response.
    pub fn finalize_block(&self, header: &BlockHeader, txs: &[Bytes]) -> Result<FinalizeBlockResponse, AppError> {
        if let Some(done) = self.finalized.lock().as_ref().filter(|done| done.height == header.height) {
            if done.hash != header.hash {
                return Err(AppError::ConflictingFinalize {
                    height: header.height,
                    existing: done.hash,
                });
            }
            debug!(height = header.height, "finalize replayed");
            return Ok(done.response.clone());
        }

        let block = self.speculation.confirm(header.height, header.hash, || {
            self.processor.process_block(&*self.store.snapshot(), header, txs)
        })?;

        self.store.write_pending(block.height, block.changes.clone());
        let app_hash = self.store.working_hash();
        self.write_receipts(&block);
        info!(
            height = block.height,
            txs = block.tx_results.len(),
            evm_gas_used = block.evm_gas_used,
            %app_hash,
            "block finalized"
        );

        let ProcessedBlock {
            mut events,
            tx_results,
            end_block,
            ..
        } = block;
        events.extend(end_block.events);
        let response = FinalizeBlockResponse {
            events,
            tx_results,
            validator_updates: end_block.validator_updates,
            consensus_param_updates: end_block.consensus_param_updates,
            app_hash,
        };
        self.record_finalized(header, response.clone());
        Ok(response)
    }

    fn write_receipts(&self, block: &ProcessedBlock) {
        let (receipts, bloom) = build_receipts(block);
        if let Err(err) = self.receipts.write_block(block.height, receipts, bloom) {
            warn!(height = block.height, %err, "failed to write receipts");
        }
    }

    fn record_finalized(&self, header: &BlockHeader, response: FinalizeBlockResponse) {
        *self.finalized.lock() = Some(FinalizedBlock {
            height: header.height,
            hash: header.hash,
            response,
            committed: false,
        });
    }

    /// Persists the last finalized block.
    pub fn commit(&self) -> Result<CommitResponse, AppError> {
        let mut finalized = self.finalized.lock();
        let Some(done) = finalized.as_mut().filter(|done| !done.committed) else {
            return Err(AppError::NothingToCommit(self.store.last_committed_height() + 1));
        };
        let app_hash = self.store.commit_pending_writes(done.height)?;
        done.committed = true;
        debug!(height = done.height, %app_hash, "block committed");
        Ok(CommitResponse {
            height: done.height,
            app_hash,
        })
    }

    pub fn begin_block(&self, header: &BlockHeader) -> Result<Vec<Event>, AppError> {
        let ctx = self.processor.block_context(header);
        let snapshot = self.store.snapshot();
        let mut branch = Branch::new(&*snapshot);
        let events = self
            .processor
            .hooks()
            .begin_block(&mut branch, &ctx, header)
            .map_err(BlockError::from)?;
        let changes = branch.into_changes();

        *self.deliver.lock() = Some(DeliverState {
            header: header.clone(),
            ctx,
            snapshot,
            changes,
            events: events.clone(),
            tx_results: Vec::new(),
            evm_gas_used: 0,
        });
        Ok(events)
    }

    /// Executes one transaction of the open block. Its fee is credited to
    /// the collector right away.
    pub fn deliver_tx(&self, raw_tx: Bytes) -> Result<TxResult, AppError> {
        let mut guard = self.deliver.lock();
        let state = guard.as_mut().ok_or(AppError::NoDeliverState)?;

        let prepared = self.processor.preprocess(&state.ctx, std::slice::from_ref(&raw_tx));
        let Some(tx) = prepared.into_iter().next() else {
            return Err(AppError::NoDeliverState);
        };

        let snapshot = state.snapshot.clone();
        let mut block = Branch::with_changes(&*snapshot, std::mem::take(&mut state.changes));
        let mut tx_state = Branch::new(&block);
        let applier = self.processor.applier();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| applier.apply(&mut tx_state, &state.ctx, &tx)));
        let result = match outcome {
            Ok(result) => {
                let changes = tx_state.into_changes();
                block.apply(changes);
                result
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(height = state.ctx.height, %message, "transaction panicked");
                panic_result(&tx, &message)
            }
        };
        if let Some(event) = write_deferred_balances(
            &mut block,
            &self.processor.config().fee_collector,
            std::slice::from_ref(&result),
        ) {
            state.events.push(event);
        }

        state.changes = block.into_changes();
        state.evm_gas_used += result.evm_gas_used;
        state.tx_results.push(result.clone());
        Ok(result)
    }

    /// Closes the open block and stages its writes for `commit`.
    pub fn end_block(&self) -> Result<EndBlockResponse, AppError> {
        let state = self.deliver.lock().take().ok_or(AppError::NoDeliverState)?;
        let mut block = Branch::with_changes(&*state.snapshot, state.changes);
        let end_block = self
            .processor
            .hooks()
            .end_block(&mut block, &state.ctx, state.evm_gas_used)
            .map_err(BlockError::from)?;

        self.store.write_pending(state.ctx.height, block.into_changes());
        let app_hash = self.store.working_hash();

        let mut events = state.events;
        events.extend(end_block.events.iter().cloned());
        let response = FinalizeBlockResponse {
            events,
            tx_results: state.tx_results,
            validator_updates: end_block.validator_updates.clone(),
            consensus_param_updates: end_block.consensus_param_updates.clone(),
            app_hash,
        };
        self.record_finalized(&state.header, response);
        Ok(end_block)
    }

    /// App hash reported for the last finalized block.
    pub fn last_app_hash(&self) -> Option<B256> {
        self.finalized.lock().as_ref().map(|done| done.response.app_hash)
    }
}
