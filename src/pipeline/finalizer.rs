//! Receipt writing, off the critical path.
//!
//! Nothing this stage does can fail a block: errors and panics are logged
//! and the block is skipped.

use super::stage::{self, CancelToken};
use super::ExecutedBlock;
use crate::receipts::{build_receipts, ReceiptStore};
use crossbeam::channel::Receiver;
use occ_executor::panic_message;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub(super) fn worker(
    receipts: Arc<dyn ReceiptStore>,
    input: Receiver<Arc<ExecutedBlock>>,
    last_finalized: Arc<AtomicU64>,
) -> impl FnOnce(CancelToken) + Send + 'static {
    move |cancel| {
        while let Some(executed) = stage::recv(&input, &cancel) {
            let height = executed.header.height;
            let Ok(block) = &executed.result else {
                debug!(height, "no receipts for failed block");
                continue;
            };

            let written = panic::catch_unwind(AssertUnwindSafe(|| {
                let (block_receipts, bloom) = build_receipts(block);
                let count = block_receipts.len();
                receipts.write_block(height, block_receipts, bloom).map(|()| count)
            }));
            match written {
                Ok(Ok(count)) => {
                    debug!(height, receipts = count, "block finalized");
                    last_finalized.fetch_max(height, Ordering::SeqCst);
                }
                Ok(Err(err)) => warn!(height, %err, "failed to write receipts"),
                Err(payload) => warn!(height, message = %panic_message(payload.as_ref()), "finalizer panicked"),
            }
        }
    }
}
