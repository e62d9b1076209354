//! Whole-block state transition.
//!
//! Begin-block, the prioritized batch, deferred balances, mid-block, the
//! remaining batch, deferred balances again, then end-block. Each batch
//! goes through the [`ExecutionPathSelector`]; results are reported in
//! block order.

use crate::apply::{write_deferred_balances, TxApplier};
use crate::config::ExecutionConfig;
use crate::error::{BlockError, ConfigError};
use crate::executor::{ExecutionPath, ExecutionPathSelector};
use crate::handlers::HandlerRegistry;
use crate::hooks::BlockHooks;
use crate::preprocess::{PreparedTx, Preprocessor};
use crate::recovery::SenderRecoveryPool;
use crate::state::{Branch, ChangeSet, KvRead, KvStore};
use crate::types::{BlockContext, BlockHeader, EndBlockResponse, Event, TxResult};
use crate::vm::VirtualMachine;
use alloy_primitives::{Bytes, B256};
use occ_executor::panic_message;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

/// Everything a block's execution produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessedBlock {
    pub height: u64,
    pub hash: B256,
    pub tx_hashes: Vec<B256>,
    /// Begin-block, deferred balance and mid-block events, in order.
    pub events: Vec<Event>,
    /// One result per transaction, in block order.
    pub tx_results: Vec<TxResult>,
    pub end_block: EndBlockResponse,
    pub changes: ChangeSet,
    pub evm_gas_used: u64,
    /// Path taken by each non-empty batch.
    pub paths: Vec<ExecutionPath>,
}

pub struct BlockProcessor {
    config: ExecutionConfig,
    applier: TxApplier,
    hooks: Arc<dyn BlockHooks>,
    selector: ExecutionPathSelector,
    preprocessor: Preprocessor,
}

impl BlockProcessor {
    pub fn new(
        config: ExecutionConfig,
        registry: Arc<HandlerRegistry>,
        vm: Arc<dyn VirtualMachine>,
        hooks: Arc<dyn BlockHooks>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let recovery = SenderRecoveryPool::new(config.recovery_threads, config.max_pooled_recoverers)?;
        let applier = TxApplier::new(registry, vm);
        Ok(Self {
            selector: ExecutionPathSelector::new(&config, applier.clone()),
            preprocessor: Preprocessor::new(Arc::new(recovery)),
            config,
            applier,
            hooks,
        })
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn hooks(&self) -> &dyn BlockHooks {
        self.hooks.as_ref()
    }

    pub fn applier(&self) -> &TxApplier {
        &self.applier
    }

    pub fn block_context(&self, header: &BlockHeader) -> BlockContext {
        BlockContext {
            height: header.height,
            hash: header.hash,
            time: header.time,
            chain_id: self.config.chain_id,
            base_fee: self.config.base_fee,
            block_max_gas: self.config.max_gas(),
            proposer: header.proposer,
        }
    }

    pub fn preprocess(&self, ctx: &BlockContext, txs: &[Bytes]) -> Vec<PreparedTx> {
        self.preprocessor.prepare(ctx, txs)
    }

    /// Executes `txs` on top of `state` without writing to it.
    pub fn process_block<R>(&self, state: &R, header: &BlockHeader, txs: &[Bytes]) -> Result<ProcessedBlock, BlockError>
    where
        R: KvRead + Sync + ?Sized,
    {
        let ctx = self.block_context(header);
        let prepared = self.preprocess(&ctx, txs);
        self.execute_prepared(state, header, &ctx, prepared)
    }

    /// Executes an already preprocessed block.
    ///
    /// A panic anywhere in the block becomes [`BlockError::Panicked`]; an
    /// upgrade signalled by the hooks is returned unchanged.
    pub fn execute_prepared<R>(
        &self,
        state: &R,
        header: &BlockHeader,
        ctx: &BlockContext,
        txs: Vec<PreparedTx>,
    ) -> Result<ProcessedBlock, BlockError>
    where
        R: KvRead + Sync + ?Sized,
    {
        let start = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run(state, header, ctx, txs)));
        let processed = match outcome {
            Ok(result) => result?,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(height = ctx.height, %message, "block processing panicked");
                return Err(BlockError::Panicked(message));
            }
        };
        debug!(
            height = ctx.height,
            txs = processed.tx_results.len(),
            writes = processed.changes.len(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "block processed"
        );
        Ok(processed)
    }

    fn run<R>(
        &self,
        state: &R,
        header: &BlockHeader,
        ctx: &BlockContext,
        txs: Vec<PreparedTx>,
    ) -> Result<ProcessedBlock, BlockError>
    where
        R: KvRead + Sync + ?Sized,
    {
        let mut block = Branch::new(state);
        let tx_hashes = txs.iter().map(|tx| tx.hash).collect();
        let mut events = self.hooks.begin_block(&mut block, ctx, header)?;

        let (prioritized, rest): (Vec<_>, Vec<_>) = txs.into_iter().partition(|tx| self.applier.is_prioritized(tx));
        let mut indexed: Vec<(usize, TxResult)> = Vec::with_capacity(prioritized.len() + rest.len());
        let mut paths = Vec::new();

        self.run_batch(&mut block, ctx, &prioritized, &mut indexed, &mut events, &mut paths);
        events.extend(self.hooks.mid_block(&mut block, ctx)?);
        self.run_batch(&mut block, ctx, &rest, &mut indexed, &mut events, &mut paths);

        indexed.sort_by_key(|(index, _)| *index);
        let tx_results: Vec<TxResult> = indexed.into_iter().map(|(_, result)| result).collect();
        let evm_gas_used = tx_results.iter().map(|result| result.evm_gas_used).sum();
        let end_block = self.hooks.end_block(&mut block, ctx, evm_gas_used)?;

        Ok(ProcessedBlock {
            height: ctx.height,
            hash: ctx.hash,
            tx_hashes,
            events,
            tx_results,
            end_block,
            changes: block.into_changes(),
            evm_gas_used,
            paths,
        })
    }

    fn run_batch<R>(
        &self,
        block: &mut Branch<'_, R>,
        ctx: &BlockContext,
        batch: &[PreparedTx],
        indexed: &mut Vec<(usize, TxResult)>,
        events: &mut Vec<Event>,
        paths: &mut Vec<ExecutionPath>,
    ) where
        R: KvRead + Sync + ?Sized,
    {
        if batch.is_empty() {
            return;
        }
        let (outcome, path) = self.selector.execute(&*block, ctx, batch);
        block.apply(outcome.changes);
        if let Some(event) = write_deferred_balances(block, &self.config.fee_collector, &outcome.results) {
            events.push(event);
        }
        indexed.extend(batch.iter().map(|tx| tx.index).zip(outcome.results));
        paths.push(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, NativeLedgerTx, NativeMsg, TypedTx, VirtualMachineTx};
    use crate::error::HookError;
    use crate::handlers::{MsgAggregateVote, MSG_AGGREGATE_VOTE};
    use crate::hooks::StandardHooks;
    use crate::keys;
    use crate::state::{MemStore, StateStore};
    use crate::types::codes;
    use crate::vm::TransferVm;
    use alloy_primitives::{Address, U256};
    use k256::ecdsa::SigningKey;
    use std::collections::BTreeMap;

    fn signer(i: u8) -> (SigningKey, Address) {
        let key = SigningKey::from_bytes(&[i + 1; 32].into()).expect("valid key");
        let mut probe = transfer_tx(0, Address::ZERO);
        probe.sign(&key).expect("signs");
        let address = probe.recover_sender().expect("recovers");
        (key, address)
    }

    fn transfer_tx(nonce: u64, to: Address) -> VirtualMachineTx {
        VirtualMachineTx {
            chain_id: 1,
            nonce,
            gas_limit: 21_000,
            max_fee_per_gas: U256::from(2),
            max_priority_fee_per_gas: U256::from(1),
            to: Some(to),
            value: U256::from(100),
            data: Bytes::new(),
            signature: Vec::new(),
        }
    }

    fn signed_transfer(key: &SigningKey, nonce: u64, to: Address) -> Bytes {
        let mut tx = transfer_tx(nonce, to);
        tx.sign(key).expect("signs");
        Bytes::from(TypedTx::Vm(tx).encode().expect("encodes"))
    }

    fn oracle_vote(signer: Address) -> Bytes {
        let msg = NativeMsg::new(MSG_AGGREGATE_VOTE, &MsgAggregateVote { exchange_rates: "1.0uusd".into() })
            .expect("encodes");
        let tx = NativeLedgerTx {
            signer,
            fee: U256::ZERO,
            gas_limit: 10_000,
            msgs: vec![msg],
        };
        Bytes::from(TypedTx::Native(tx).encode().expect("encodes"))
    }

    fn setup(giga: bool, occ: bool) -> (BlockProcessor, MemStore, Vec<Bytes>) {
        let config = ExecutionConfig {
            giga_enabled: giga,
            occ_enabled: occ,
            concurrency_workers: 4,
            base_fee: U256::from(1),
            ..ExecutionConfig::minimal()
        };
        let processor = BlockProcessor::new(
            config,
            Arc::new(HandlerRegistry::standard()),
            Arc::new(TransferVm),
            Arc::new(StandardHooks::new()),
        )
        .expect("valid config");

        let accounts: Vec<_> = (0..4).map(signer).collect();
        let genesis: BTreeMap<_, _> = accounts
            .iter()
            .map(|(_, address)| (keys::balance_key(address), keys::encode_u256(U256::from(1_000_000u64))))
            .collect();

        let mut txs = Vec::new();
        for round in 0..3u64 {
            for (i, (key, _)) in accounts.iter().enumerate() {
                let to = accounts[(i + 1) % accounts.len()].1;
                txs.push(signed_transfer(key, round, to));
            }
        }
        // Vote placed mid-block, executed in the prioritized batch.
        txs.insert(5, oracle_vote(accounts[0].1));
        // Undecodable.
        txs.push(Bytes::from_static(b"garbage"));

        (processor, MemStore::with_genesis(genesis), txs)
    }

    fn header(height: u64) -> BlockHeader {
        BlockHeader {
            height,
            hash: B256::repeat_byte(height as u8),
            time: height * 10,
            ..BlockHeader::default()
        }
    }

    #[test]
    fn test_block_results_in_block_order() {
        let (processor, store, txs) = setup(false, true);
        let block = processor
            .process_block(&*store.snapshot(), &header(1), &txs)
            .expect("block executes");

        assert_eq!(block.tx_results.len(), txs.len());
        assert_eq!(block.tx_hashes[5], codec::tx_hash(&txs[5]));
        assert!(block.tx_results[5].is_ok(), "{:?}", block.tx_results[5]);
        assert!(block.tx_results[..5].iter().all(TxResult::is_ok));
        assert_eq!(block.tx_results.last().map(|r| r.code), Some(codes::TX_DECODE));
        assert_eq!(block.evm_gas_used, 12 * 21_000);
        assert_eq!(block.paths, vec![ExecutionPath::Occ, ExecutionPath::Occ]);

        // 12 transfers at price 2 credited after the second batch.
        let snapshot = store.snapshot();
        let state = Branch::with_changes(&*snapshot, block.changes.clone());
        let collector = processor.config().fee_collector;
        assert_eq!(keys::get_balance(&state, &collector), U256::from(12 * 21_000 * 2));
        assert!(block.events.iter().any(|e| e.kind == "deferred_balances"));
    }

    #[test]
    fn test_every_path_produces_the_same_block() {
        let mut blocks = Vec::new();
        for (giga, occ) in [(true, true), (true, false), (false, true), (false, false)] {
            let (processor, store, txs) = setup(giga, occ);
            let mut block = processor
                .process_block(&*store.snapshot(), &header(1), &txs)
                .expect("block executes");
            block.paths.clear();
            blocks.push(block);
        }
        assert!(blocks.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[test]
    fn test_upgrade_is_returned_not_recovered() {
        let (_, store, txs) = setup(false, false);
        let processor = BlockProcessor::new(
            ExecutionConfig::minimal(),
            Arc::new(HandlerRegistry::standard()),
            Arc::new(TransferVm),
            Arc::new(StandardHooks::with_upgrade("v2", 2)),
        )
        .expect("valid config");

        let err = processor
            .process_block(&*store.snapshot(), &header(2), &txs)
            .expect_err("upgrade height");
        assert_eq!(
            err,
            BlockError::from(HookError::UpgradeRequired {
                name: "v2".into(),
                height: 2
            })
        );
        assert!(err.is_upgrade());
    }
}
