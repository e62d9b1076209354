//! Shared value types: resource accesses, transaction results, events and
//! the per-block execution context.

use alloy_primitives::{Address, Log, B256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result codes and codespaces.
pub mod codes {
    pub const SDK_CODESPACE: &str = "sdk";
    pub const EVM_CODESPACE: &str = "evm";

    pub const OK: u32 = 0;
    pub const TX_DECODE: u32 = 2;
    pub const INVALID_SEQUENCE: u32 = 3;
    pub const UNAUTHORIZED: u32 = 4;
    pub const INSUFFICIENT_FUNDS: u32 = 5;
    pub const UNKNOWN_REQUEST: u32 = 6;
    pub const OUT_OF_GAS: u32 = 11;
    pub const INSUFFICIENT_FEE: u32 = 13;
    pub const INVALID_REQUEST: u32 = 18;
    pub const INVALID_CHAIN_ID: u32 = 28;
    pub const PANIC: u32 = 111222;

    /// Virtual machine execution reverted.
    pub const EVM_REVERTED: u32 = 2;
    pub const EVM_FAILED: u32 = 3;

    /// The fast path could not safely run a batch; redo it on a safer path.
    pub const ABORT_CODE: u32 = 9_999;
    pub const ABORT_CODESPACE: &str = "fastpath";
    pub const ABORT_INFO: &str = "fast path aborted";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AccessType {
    Read,
    Write,
    /// Terminates a transaction's operation list.
    Commit,
}

/// Hierarchical resource name, segments separated by `/`.
///
/// `bank/balances` is a child of `bank`; the empty name is the root and is
/// related to every resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceType(String);

impl ResourceType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn any() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if `self` equals `other` or encloses it.
    pub fn covers(&self, other: &ResourceType) -> bool {
        self.0.is_empty()
            || self.0 == other.0
            || (other.0.len() > self.0.len()
                && other.0.starts_with(&self.0)
                && other.0.as_bytes()[self.0.len()] == b'/')
    }

    /// True if either resource encloses the other.
    pub fn is_related(&self, other: &ResourceType) -> bool {
        self.covers(other) || other.covers(self)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("*")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Identifier matching every identifier of a resource.
pub const WILDCARD: &str = "*";

/// A declared read, write or commit intent on a resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceAccessOperation {
    pub access_type: AccessType,
    pub resource_type: ResourceType,
    pub identifier_template: String,
}

impl ResourceAccessOperation {
    pub fn new(access_type: AccessType, resource_type: ResourceType, identifier: impl Into<String>) -> Self {
        Self {
            access_type,
            resource_type,
            identifier_template: identifier.into(),
        }
    }

    pub fn read(resource: &str, identifier: impl Into<String>) -> Self {
        Self::new(AccessType::Read, ResourceType::new(resource), identifier)
    }

    pub fn write(resource: &str, identifier: impl Into<String>) -> Self {
        Self::new(AccessType::Write, ResourceType::new(resource), identifier)
    }

    pub fn commit() -> Self {
        Self::new(AccessType::Commit, ResourceType::any(), WILDCARD)
    }

    pub fn is_commit(&self) -> bool {
        self.access_type == AccessType::Commit
    }

    /// True if the two operations touch overlapping state.
    ///
    /// Different but related resource types always overlap; on the same type
    /// the identifiers must match or one must be the wildcard.
    pub fn overlaps(&self, other: &ResourceAccessOperation) -> bool {
        if self.is_commit() || other.is_commit() {
            return false;
        }
        if self.resource_type == other.resource_type {
            self.identifier_template == other.identifier_template
                || self.identifier_template == WILDCARD
                || other.identifier_template == WILDCARD
        } else {
            self.resource_type.is_related(&other.resource_type)
        }
    }

    /// True if this operation permits accessing `resource`/`identifier`.
    pub fn permits(&self, access: AccessType, resource: &ResourceType, identifier: &str) -> bool {
        let kind_ok = match access {
            AccessType::Read => matches!(self.access_type, AccessType::Read | AccessType::Write),
            AccessType::Write => self.access_type == AccessType::Write,
            AccessType::Commit => false,
        };
        kind_ok
            && self.resource_type.covers(resource)
            && (self.identifier_template == WILDCARD
                || (self.resource_type == *resource && self.identifier_template == identifier))
    }
}

impl fmt::Display for ResourceAccessOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}/{}", self.access_type, self.resource_type, self.identifier_template)
    }
}

/// A typed event with string attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: String,
    pub attributes: Vec<(String, String)>,
}

impl Event {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attributes: Vec::new(),
        }
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.attributes.push((key.into(), value.to_string()));
        self
    }
}

/// Outcome of one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TxResult {
    pub code: u32,
    pub codespace: String,
    pub log: String,
    pub info: String,
    pub gas_wanted: u64,
    pub gas_used: u64,
    pub events: Vec<Event>,
    pub logs: Vec<Log>,
    /// Fee owed to the fee collector, credited when the batch is flushed.
    pub deferred_fee: U256,
    /// Set for virtual machine transactions.
    pub evm_gas_used: u64,
}

impl TxResult {
    pub fn failed(code: u32, codespace: &str, log: impl Into<String>) -> Self {
        Self {
            code,
            codespace: codespace.to_string(),
            log: log.into(),
            ..Default::default()
        }
    }

    pub fn sdk_error(code: u32, log: impl Into<String>) -> Self {
        Self::failed(code, codes::SDK_CODESPACE, log)
    }

    /// The sentinel returned by the fast path to request a redo.
    pub fn abort() -> Self {
        Self {
            code: codes::ABORT_CODE,
            codespace: codes::ABORT_CODESPACE.to_string(),
            info: codes::ABORT_INFO.to_string(),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == codes::OK
    }

    pub fn is_abort(&self) -> bool {
        self.code == codes::ABORT_CODE && self.codespace == codes::ABORT_CODESPACE && self.info == codes::ABORT_INFO
    }

    pub fn with_gas(mut self, gas_wanted: u64, gas_used: u64) -> Self {
        self.gas_wanted = gas_wanted;
        self.gas_used = gas_used;
        self
    }
}

/// Per-block context handed to every transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockContext {
    pub height: u64,
    pub hash: B256,
    /// Unix seconds.
    pub time: u64,
    pub chain_id: u64,
    pub base_fee: U256,
    pub block_max_gas: Option<u64>,
    pub proposer: Address,
}

/// Misbehavior reported by consensus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Misbehavior {
    pub validator: Address,
    pub height: u64,
}

/// One validator's participation in the last commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteInfo {
    pub validator: Address,
    pub power: i64,
    pub signed_last_block: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorUpdate {
    pub pub_key: Vec<u8>,
    pub power: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusParams {
    pub max_block_bytes: i64,
    pub max_block_gas: i64,
}

/// Header facets delivered alongside a block's transactions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockHeader {
    pub height: u64,
    pub hash: B256,
    pub time: u64,
    pub proposer: Address,
    pub byzantine_validators: Vec<Misbehavior>,
    pub last_commit_votes: Vec<VoteInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EndBlockResponse {
    pub events: Vec<Event>,
    pub validator_updates: Vec<ValidatorUpdate>,
    pub consensus_param_updates: Option<ConsensusParams>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_hierarchy() {
        let bank = ResourceType::new("bank");
        let balances = ResourceType::new("bank/balances");
        let banker = ResourceType::new("banker");

        assert!(bank.covers(&balances));
        assert!(!balances.covers(&bank));
        assert!(!bank.covers(&banker));
        assert!(ResourceType::any().covers(&banker));
        assert!(balances.is_related(&bank));
    }

    #[test]
    fn test_operation_overlap() {
        let a = ResourceAccessOperation::write("bank/balances", "0xaa");
        let b = ResourceAccessOperation::read("bank/balances", "0xbb");
        let wild = ResourceAccessOperation::read("bank/balances", WILDCARD);
        let parent = ResourceAccessOperation::read("bank", "0xcc");

        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&wild));
        assert!(a.overlaps(&parent));
        assert!(!a.overlaps(&ResourceAccessOperation::commit()));
    }

    #[test]
    fn test_operation_permits() {
        let balances = ResourceType::new("bank/balances");
        let write = ResourceAccessOperation::write("bank/balances", "0xaa");
        let read = ResourceAccessOperation::read("bank/balances", "0xaa");
        let parent = ResourceAccessOperation::write("bank", WILDCARD);

        assert!(write.permits(AccessType::Read, &balances, "0xaa"));
        assert!(write.permits(AccessType::Write, &balances, "0xaa"));
        assert!(!read.permits(AccessType::Write, &balances, "0xaa"));
        assert!(!write.permits(AccessType::Write, &balances, "0xbb"));
        assert!(parent.permits(AccessType::Write, &balances, "0xbb"));
    }

    #[test]
    fn test_abort_sentinel() {
        assert!(TxResult::abort().is_abort());
        assert!(!TxResult::sdk_error(codes::ABORT_CODE, "").is_abort());
    }
}
