//! Optimistic parallel executor for ordered transaction batches.
//!
//! This crate implements a Block-STM style engine: transactions run
//! speculatively in parallel against a multi-version map, reads are tracked,
//! and transactions commit strictly in index order. A transaction whose read
//! set changed before it could commit is aborted and re-executed with an
//! incremented incarnation, so the committed outputs are always identical to
//! a one-by-one run in index order.
//!
//! # Core Components
//!
//! - **MVHashMap**: Multi-version map of writes keyed by transaction index
//! - **Scheduler**: Hands out executions, tracks statuses and commits in order
//! - **ParallelExecutor**: Runs worker threads over a [`TransactionTask`]
//!
//! # Algorithm Overview
//!
//! 1. Transactions are executed speculatively in parallel
//! 2. Each write records which transactions have read from the previous version
//! 3. When a transaction writes, readers with higher indices are aborted
//! 4. Aborted transactions are re-executed with incremented incarnation numbers
//! 5. The lowest uncommitted transaction is validated against its read set and
//!    committed once every lower transaction is done
//!
//! # Example
//!
//! ```rust,ignore
//! use occ_executor::{ExecutorConfig, ParallelExecutor};
//!
//! let executor = ParallelExecutor::new(ExecutorConfig { num_threads: 4 });
//! let result = executor.execute_block(txs.len(), &task, &storage);
//! assert_eq!(result.outputs.len(), txs.len());
//! ```

pub mod executor;
pub mod mvhashmap;
pub mod scheduler;
pub mod types;

pub use executor::{
    panic_message, BlockExecutionResult, ExecutorConfig, ParallelExecutor, Storage, TransactionTask,
    TxnView,
};
pub use mvhashmap::{MVHashMap, ReadResult};
pub use types::{Incarnation, ReadOrigin, TxnIndex, Version};
