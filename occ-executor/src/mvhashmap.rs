//! Multi-version hashmap for storing versioned key/value writes.
//!
//! This is the core data structure that enables parallel execution with
//! optimistic concurrency control. For each key, it stores a versioned
//! history of writes, allowing transactions to read from the correct
//! version based on transaction ordering.

use crate::types::{Incarnation, ReadOrigin, TxnIndex, Version};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::hash::Hash;

/// Entry in the version history for a key.
#[derive(Debug, Clone)]
pub struct VersionedEntry<V> {
    pub version: Version,
    /// `None` marks a deletion.
    pub value: Option<V>,
    /// Transactions that have read from this version (for push-based invalidation).
    pub readers: Vec<TxnIndex>,
}

/// Multi-version hashmap storing versioned writes.
///
/// Structure: K -> BTreeMap<TxnIndex -> VersionedEntry>
///
/// The BTreeMap is keyed by TxnIndex for efficient range queries to find
/// the latest version written by a transaction with index < reader index.
pub struct MVHashMap<K, V> {
    data: DashMap<K, BTreeMap<TxnIndex, VersionedEntry<V>>>,
    /// Readers that found no lower write and fell through to storage.
    storage_readers: DashMap<K, Vec<TxnIndex>>,
}

/// Result of reading from the MVHashMap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult<V> {
    /// Value found at a specific version (`None` if that version deleted the key).
    Versioned(Version, Option<V>),
    /// No version found, should read from base storage.
    Storage,
}

impl<V> ReadResult<V> {
    /// The origin to record in the reader's read set.
    pub fn origin(&self) -> ReadOrigin {
        match self {
            ReadResult::Versioned(version, _) => ReadOrigin::Versioned(*version),
            ReadResult::Storage => ReadOrigin::Storage,
        }
    }
}

impl<K, V> MVHashMap<K, V>
where
    K: Eq + Hash + Ord + Clone,
    V: Clone,
{
    /// Creates a new empty multi-version hashmap.
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            storage_readers: DashMap::new(),
        }
    }

    /// Reads the latest version of a key visible to the given transaction index.
    pub fn read(&self, key: &K, reader_txn_idx: TxnIndex) -> ReadResult<V> {
        if let Some(versions) = self.data.get(key) {
            if let Some((_, entry)) = versions.range(..reader_txn_idx).next_back() {
                return ReadResult::Versioned(entry.version, entry.value.clone());
            }
        }
        ReadResult::Storage
    }

    /// Writes a new version of a key.
    ///
    /// Returns the transactions with a higher index that read the value this
    /// write now shadows and therefore need to be invalidated.
    pub fn write(
        &self,
        key: K,
        writer_txn_idx: TxnIndex,
        incarnation: Incarnation,
        value: Option<V>,
    ) -> Vec<TxnIndex> {
        let mut invalidated = Vec::new();
        let mut versions = self.data.entry(key.clone()).or_default();

        match versions.range(..writer_txn_idx).next_back() {
            Some((_, prev)) => invalidated.extend(
                prev.readers
                    .iter()
                    .filter(|&&reader| reader > writer_txn_idx)
                    .copied(),
            ),
            None => {
                if let Some(readers) = self.storage_readers.get(&key) {
                    invalidated.extend(readers.iter().filter(|&&r| r > writer_txn_idx).copied());
                }
            }
        }

        // A re-execution replacing its own earlier write also shadows that
        // write's readers.
        if let Some(own) = versions.get(&writer_txn_idx) {
            invalidated.extend(own.readers.iter().copied());
        }

        versions.insert(
            writer_txn_idx,
            VersionedEntry {
                version: Version::new(writer_txn_idx, incarnation),
                value,
                readers: Vec::new(),
            },
        );

        invalidated.sort_unstable();
        invalidated.dedup();
        invalidated
    }

    /// Records that a transaction has read a key from the given origin.
    pub fn record_read(&self, key: &K, reader_txn_idx: TxnIndex, origin: ReadOrigin) {
        match origin {
            ReadOrigin::Versioned(version) => {
                if let Some(mut versions) = self.data.get_mut(key) {
                    if let Some(entry) = versions.get_mut(&version.txn_idx) {
                        if entry.version == version && !entry.readers.contains(&reader_txn_idx) {
                            entry.readers.push(reader_txn_idx);
                        }
                    }
                }
            }
            ReadOrigin::Storage => {
                let mut readers = self.storage_readers.entry(key.clone()).or_default();
                if !readers.contains(&reader_txn_idx) {
                    readers.push(reader_txn_idx);
                }
            }
        }
    }

    /// Removes the writes of `txn_idx` for keys it no longer writes.
    ///
    /// Returns the readers of the removed entries.
    pub fn remove_writes<'a, I>(&self, txn_idx: TxnIndex, keys: I) -> Vec<TxnIndex>
    where
        I: IntoIterator<Item = &'a K>,
        K: 'a,
    {
        let mut invalidated = Vec::new();
        for key in keys {
            if let Some(mut versions) = self.data.get_mut(key) {
                if let Some(entry) = versions.remove(&txn_idx) {
                    invalidated.extend(entry.readers);
                }
            }
        }
        invalidated.sort_unstable();
        invalidated.dedup();
        invalidated
    }

    /// Checks that a recorded read would still be served from the same origin.
    pub fn validate_read(&self, key: &K, reader_txn_idx: TxnIndex, origin: ReadOrigin) -> bool {
        self.read(key, reader_txn_idx).origin() == origin
    }

    /// Returns the final value of every written key, sorted by key.
    pub fn final_writes(&self) -> Vec<(K, Option<V>)> {
        let mut result: Vec<(K, Option<V>)> = self
            .data
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .values()
                    .next_back()
                    .map(|latest| (entry.key().clone(), latest.value.clone()))
            })
            .collect();
        result.sort_by(|a, b| a.0.cmp(&b.0));
        result
    }
}

impl<K, V> Default for MVHashMap<K, V>
where
    K: Eq + Hash + Ord + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write() {
        let mv: MVHashMap<u64, u64> = MVHashMap::new();

        assert_eq!(mv.read(&7, 1), ReadResult::Storage);

        mv.write(7, 0, 0, Some(100));

        match mv.read(&7, 1) {
            ReadResult::Versioned(version, value) => {
                assert_eq!(version.txn_idx, 0);
                assert_eq!(value, Some(100));
            }
            other => panic!("Expected Versioned result, got {:?}", other),
        }

        // Transaction 0 never sees its own write through the map.
        assert_eq!(mv.read(&7, 0), ReadResult::Storage);
    }

    #[test]
    fn test_invalidation() {
        let mv: MVHashMap<u64, u64> = MVHashMap::new();

        mv.write(1, 0, 0, Some(100));

        let result = mv.read(&1, 2);
        mv.record_read(&1, 2, result.origin());

        let invalidated = mv.write(1, 1, 0, Some(200));
        assert_eq!(invalidated, vec![2]);
    }

    #[test]
    fn test_storage_read_invalidation() {
        let mv: MVHashMap<u64, u64> = MVHashMap::new();

        mv.record_read(&5, 3, ReadOrigin::Storage);
        assert!(mv.validate_read(&5, 3, ReadOrigin::Storage));

        let invalidated = mv.write(5, 1, 0, Some(1));
        assert_eq!(invalidated, vec![3]);
        assert!(!mv.validate_read(&5, 3, ReadOrigin::Storage));

        // Writers above the reader never invalidate it.
        mv.record_read(&6, 2, ReadOrigin::Storage);
        assert!(mv.write(6, 4, 0, Some(1)).is_empty());
    }

    #[test]
    fn test_remove_writes_and_final_state() {
        let mv: MVHashMap<u64, u64> = MVHashMap::new();

        mv.write(1, 0, 0, Some(10));
        mv.write(1, 2, 0, None);
        mv.write(2, 1, 0, Some(20));

        let read = mv.read(&2, 3);
        mv.record_read(&2, 3, read.origin());
        assert_eq!(mv.remove_writes(1, [&2]), vec![3]);

        assert_eq!(mv.final_writes(), vec![(1, None)]);
    }
}
