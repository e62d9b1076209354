//! State access layer.
//!
//! Execution never writes to the store directly. Every block, batch and
//! transaction runs on a [`Branch`] over a read-only parent; its
//! [`ChangeSet`] is merged upward on success and dropped on failure, so
//! partial effects of any aborted path leave no trace.

mod branch;
mod layered;
mod mem;

pub use branch::Branch;
pub use layered::LayeredView;
pub use mem::{MemSnapshot, MemStore};

use crate::error::StoreError;
use alloy_primitives::B256;
use std::collections::BTreeMap;
use std::sync::Arc;

pub type Key = Vec<u8>;
pub type Value = Vec<u8>;

/// Ordered writes; `None` deletes the key.
pub type ChangeSet = BTreeMap<Key, Option<Value>>;

pub trait KvRead {
    fn get(&self, key: &[u8]) -> Option<Value>;
}

pub trait KvStore: KvRead {
    fn set(&mut self, key: Key, value: Value);

    fn delete(&mut self, key: &[u8]);

    fn apply(&mut self, changes: ChangeSet) {
        for (key, value) in changes {
            match value {
                Some(value) => self.set(key, value),
                None => self.delete(&key),
            }
        }
    }
}

impl<T: KvRead + ?Sized> KvRead for &T {
    fn get(&self, key: &[u8]) -> Option<Value> {
        (**self).get(key)
    }
}

impl<T: KvRead + ?Sized> KvRead for Arc<T> {
    fn get(&self, key: &[u8]) -> Option<Value> {
        (**self).get(key)
    }
}

/// An immutable view of state at some height, shareable across threads.
pub trait Snapshot: KvRead + Send + Sync {
    fn height(&self) -> u64;
}

/// The versioned store collaborator.
pub trait StateStore: Send + Sync {
    /// Committed state.
    fn snapshot(&self) -> Arc<dyn Snapshot>;

    /// Committed state plus every pending layer, in height order.
    fn pending_view(&self) -> Arc<dyn Snapshot>;

    /// Stages a block's writes; replaces earlier writes staged for `height`.
    fn write_pending(&self, height: u64, changes: ChangeSet);

    fn discard_pending(&self, height: u64);

    /// Hash over committed state plus all pending layers.
    fn working_hash(&self) -> B256;

    /// Folds pending layers up to `height` into committed state.
    fn commit_pending_writes(&self, height: u64) -> Result<B256, StoreError>;

    fn last_committed_height(&self) -> u64;
}
