//! Single-writer execution stage.
//!
//! Each block executes on the store's pending view, so it sees every
//! earlier block of the pipeline whether or not that block has been
//! committed yet. Committing is left to the driver.

use super::stage::{self, CancelToken};
use super::{ExecutedBlock, PreprocessedBlock};
use crate::processor::BlockProcessor;
use crate::state::StateStore;
use crossbeam::channel::{Receiver, Sender};
use std::sync::Arc;
use tracing::{debug, error, warn};

pub(super) fn worker(
    processor: Arc<BlockProcessor>,
    store: Arc<dyn StateStore>,
    input: Receiver<PreprocessedBlock>,
    finalizer: Sender<Arc<ExecutedBlock>>,
    output: Sender<Arc<ExecutedBlock>>,
) -> impl FnOnce(CancelToken) + Send + 'static {
    move |cancel| {
        while let Some(PreprocessedBlock { header, ctx, txs }) = stage::recv(&input, &cancel) {
            let view = store.pending_view();
            let result = processor.execute_prepared(&*view, &header, &ctx, txs);

            let halt = match &result {
                Ok(block) => {
                    store.write_pending(block.height, block.changes.clone());
                    debug!(height = block.height, txs = block.tx_results.len(), "block executed");
                    false
                }
                Err(err) if err.is_upgrade() => {
                    error!(height = header.height, %err, "upgrade required, halting execution");
                    true
                }
                Err(err) => {
                    warn!(height = header.height, %err, "block execution failed");
                    false
                }
            };

            let executed = Arc::new(ExecutedBlock { header, result });
            if !stage::send(&finalizer, executed.clone(), &cancel) || !stage::send(&output, executed, &cancel) {
                break;
            }
            if halt {
                break;
            }
        }
    }
}
