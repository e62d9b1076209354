//! Core types for optimistic execution.

use std::fmt;

/// Transaction index in the batch (0-based).
pub type TxnIndex = usize;

/// Incarnation number (how many times a transaction has been re-executed).
pub type Incarnation = usize;

/// Version identifier for a transaction execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub txn_idx: TxnIndex,
    pub incarnation: Incarnation,
}

impl Version {
    pub fn new(txn_idx: TxnIndex, incarnation: Incarnation) -> Self {
        Self { txn_idx, incarnation }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.txn_idx, self.incarnation)
    }
}

/// Where a recorded read was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOrigin {
    /// Written by a lower transaction at this version.
    Versioned(Version),
    /// No lower transaction wrote the key; served by base storage.
    Storage,
}

/// Status of a transaction in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Queued for execution at this incarnation.
    Ready(Incarnation),
    /// Currently executing.
    Executing(Incarnation),
    /// Invalidated while executing; re-queued once the running incarnation finishes.
    Aborting(Incarnation),
    /// Finished execution, waiting for commit.
    Executed(Incarnation),
    /// Committed to final state.
    Committed,
}
