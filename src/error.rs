//! Error types.
//!
//! Per-transaction failures are never errors: they are [`TxResult`]s with a
//! non-zero code. The enums here cover scheduling policy signals, store and
//! hook failures, and block-level outcomes that reach the driver.
//!
//! [`TxResult`]: crate::types::TxResult

use alloy_primitives::B256;
use thiserror::Error;

/// Reasons a batch cannot be scheduled in parallel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DagError {
    #[error("cycle detected in dependency graph")]
    Cycle,

    /// A message whose effects cannot be described by declared accesses.
    #[error("transaction {tx_index} carries unschedulable message {msg_type}")]
    Unschedulable { tx_index: usize, msg_type: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("decode failed: {0}")]
    Decode(String),

    #[error("encode failed: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("cannot commit height {requested}: last committed height is {committed}")]
    HeightRegression { requested: u64, committed: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("contract creation is not supported")]
    CreateUnsupported,

    #[error("insufficient balance for value transfer")]
    InsufficientBalance,

    #[error("vm execution failed: {0}")]
    Execution(String),
}

/// A failed native message, reported as a result code in its codespace.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{codespace} code {code}: {log}")]
pub struct HandlerError {
    pub code: u32,
    pub codespace: &'static str,
    pub log: String,
}

impl HandlerError {
    pub fn new(code: u32, log: impl Into<String>) -> Self {
        Self {
            code,
            codespace: crate::types::codes::SDK_CODESPACE,
            log: log.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    /// A scheduled upgrade must be applied before this height executes.
    #[error("upgrade {name} required at height {height}")]
    UpgradeRequired { name: String, height: u64 },

    #[error("block hook failed: {0}")]
    Failed(String),
}

/// Sender recovery failures, scoped to one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryError {
    #[error("transaction is not a virtual machine transaction")]
    NotVmTransaction,

    #[error("transaction decode failed: {0}")]
    Decode(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("recovery task panicked: {0}")]
    Panicked(String),
}

/// Block-level failures surfaced to the driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockError {
    /// Never recovered locally; the driver must stop and upgrade.
    #[error("upgrade {name} required at height {height}")]
    UpgradeRequired { name: String, height: u64 },

    #[error(transparent)]
    Hook(HookError),

    #[error("block processing panicked: {0}")]
    Panicked(String),
}

impl From<HookError> for BlockError {
    fn from(err: HookError) -> Self {
        match err {
            HookError::UpgradeRequired { name, height } => BlockError::UpgradeRequired { name, height },
            other => BlockError::Hook(other),
        }
    }
}

impl BlockError {
    pub fn is_upgrade(&self) -> bool {
        matches!(self, BlockError::UpgradeRequired { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("pipeline is not running")]
    NotRunning,

    #[error("pipeline channel closed")]
    Closed,

    #[error("timed out waiting for pipeline output")]
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to build thread pool: {0}")]
    ThreadPool(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AppError {
    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no finalized block at height {0} to commit")]
    NothingToCommit(u64),

    #[error("block {height} already finalized with hash {existing}")]
    ConflictingFinalize { height: u64, existing: B256 },

    #[error("deliver_tx called outside begin_block/end_block")]
    NoDeliverState,
}

impl AppError {
    pub fn is_upgrade(&self) -> bool {
        matches!(self, AppError::Block(err) if err.is_upgrade())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReceiptError {
    #[error("receipts for height {0} already written")]
    AlreadyWritten(u64),
}
