//! Parallel stateless preparation of incoming blocks.

use super::stage::{self, CancelToken};
use super::{BlockInput, PreprocessedBlock};
use crate::processor::BlockProcessor;
use crossbeam::channel::{Receiver, Sender};
use std::sync::Arc;
use tracing::trace;

/// One of the stage's workers. Output order across workers is arbitrary.
pub(super) fn worker(
    processor: Arc<BlockProcessor>,
    input: Receiver<BlockInput>,
    output: Sender<PreprocessedBlock>,
) -> impl FnOnce(CancelToken) + Send + 'static {
    move |cancel| {
        while let Some(BlockInput { header, txs }) = stage::recv(&input, &cancel) {
            let ctx = processor.block_context(&header);
            let txs = processor.preprocess(&ctx, &txs);
            trace!(height = header.height, txs = txs.len(), "block preprocessed");
            if !stage::send(&output, PreprocessedBlock { header, ctx, txs }, &cancel) {
                break;
            }
        }
    }
}
