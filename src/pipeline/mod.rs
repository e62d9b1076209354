//! Four-stage block pipeline.
//!
//! ```text
//! submit -> preprocessor (N workers) -> orderer -> executor -> finalizer
//!                                                      \-> next_output
//! ```
//!
//! Every channel is bounded, so a slow stage blocks the ones upstream of
//! it. The pipeline owns both ends of each channel; stages never see a
//! closed channel while running, and `stop` shuts them down from the
//! finalizer back to the preprocessor.

mod executor;
mod finalizer;
mod orderer;
mod preprocessor;
mod stage;

pub use orderer::Orderer;
pub use stage::{CancelToken, Stage, StageState};

use crate::error::{BlockError, PipelineError, StoreError};
use crate::preprocess::PreparedTx;
use crate::processor::{BlockProcessor, ProcessedBlock};
use crate::receipts::ReceiptStore;
use crate::state::StateStore;
use crate::types::{BlockContext, BlockHeader};
use alloy_primitives::{Bytes, B256};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
pub struct BlockInput {
    pub header: BlockHeader,
    pub txs: Vec<Bytes>,
}

#[derive(Debug)]
pub struct PreprocessedBlock {
    pub header: BlockHeader,
    pub ctx: BlockContext,
    pub txs: Vec<PreparedTx>,
}

#[derive(Debug)]
pub struct ExecutedBlock {
    pub header: BlockHeader,
    pub result: Result<ProcessedBlock, BlockError>,
}

impl ExecutedBlock {
    pub fn height(&self) -> u64 {
        self.header.height
    }
}

fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    bounded(capacity)
}

pub struct BlockPipeline {
    processor: Arc<BlockProcessor>,
    store: Arc<dyn StateStore>,
    receipts: Arc<dyn ReceiptStore>,
    first_height: u64,
    workers: usize,

    input: (Sender<BlockInput>, Receiver<BlockInput>),
    preprocessed: (Sender<PreprocessedBlock>, Receiver<PreprocessedBlock>),
    ordered: (Sender<PreprocessedBlock>, Receiver<PreprocessedBlock>),
    executed: (Sender<Arc<ExecutedBlock>>, Receiver<Arc<ExecutedBlock>>),
    output: (Sender<Arc<ExecutedBlock>>, Receiver<Arc<ExecutedBlock>>),

    preprocessor: Stage,
    orderer: Stage,
    executor: Stage,
    finalizer: Stage,
    last_finalized: Arc<AtomicU64>,
}

impl BlockPipeline {
    /// Blocks must be submitted with consecutive heights from
    /// `first_height`.
    pub fn new(
        processor: Arc<BlockProcessor>,
        store: Arc<dyn StateStore>,
        receipts: Arc<dyn ReceiptStore>,
        first_height: u64,
    ) -> Self {
        let capacity = processor.config().channel_capacity;
        let workers = processor.config().preprocess_workers;
        let root = CancelToken::new();
        Self {
            processor,
            store,
            receipts,
            first_height,
            workers,
            input: channel(capacity),
            preprocessed: channel(capacity),
            ordered: channel(capacity),
            executed: channel(capacity),
            output: channel(capacity),
            preprocessor: Stage::new("preprocessor", &root),
            orderer: Stage::new("orderer", &root),
            executor: Stage::new("executor", &root),
            finalizer: Stage::new("finalizer", &root),
            last_finalized: Arc::new(AtomicU64::new(first_height.saturating_sub(1))),
        }
    }

    /// Starts every stage. Calling it again has no effect.
    pub fn start(&self) -> std::io::Result<()> {
        let started = self.finalizer.start(1, |_| {
            finalizer::worker(self.receipts.clone(), self.executed.1.clone(), self.last_finalized.clone())
        })?;
        self.executor.start(1, |_| {
            executor::worker(
                self.processor.clone(),
                self.store.clone(),
                self.ordered.1.clone(),
                self.executed.0.clone(),
                self.output.0.clone(),
            )
        })?;
        self.orderer.start(1, |_| {
            orderer::worker(self.first_height, self.preprocessed.1.clone(), self.ordered.0.clone())
        })?;
        self.preprocessor.start(self.workers, |_| {
            preprocessor::worker(self.processor.clone(), self.input.1.clone(), self.preprocessed.0.clone())
        })?;
        if started {
            info!(first_height = self.first_height, preprocess_workers = self.workers, "pipeline started");
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        [&self.preprocessor, &self.orderer, &self.executor, &self.finalizer]
            .iter()
            .all(|stage| stage.state() == StageState::Running)
    }

    /// Queues a block, waiting while the pipeline is full.
    pub fn submit(&self, block: BlockInput) -> Result<(), PipelineError> {
        if !self.is_running() {
            return Err(PipelineError::NotRunning);
        }
        self.input.0.send(block).map_err(|_| PipelineError::Closed)
    }

    /// The next executed block, in height order.
    pub fn next_output(&self, timeout: Duration) -> Result<Arc<ExecutedBlock>, PipelineError> {
        self.output.1.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => PipelineError::Timeout,
            RecvTimeoutError::Disconnected => PipelineError::Closed,
        })
    }

    /// Persists every executed block up to `height` and returns the
    /// resulting hash. Must be called from the driving thread.
    pub fn commit(&self, height: u64) -> Result<B256, StoreError> {
        self.store.commit_pending_writes(height)
    }

    pub fn working_hash(&self) -> B256 {
        self.store.working_hash()
    }

    /// Highest height whose receipts were written.
    pub fn last_finalized(&self) -> u64 {
        self.last_finalized.load(Ordering::SeqCst)
    }

    /// Stops every stage, downstream first. Calling it again has no effect.
    pub fn stop(&self) {
        self.finalizer.stop();
        self.executor.stop();
        self.orderer.stop();
        self.preprocessor.stop();
        info!(last_finalized = self.last_finalized(), "pipeline stopped");
    }
}

impl Drop for BlockPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
