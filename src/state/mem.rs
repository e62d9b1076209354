//! In-memory versioned store.

use super::{ChangeSet, Key, KvRead, LayeredView, Snapshot, StateStore, Value};
use crate::error::StoreError;
use alloy_primitives::{Keccak256, B256};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Immutable committed state at a height.
#[derive(Debug, Clone)]
pub struct MemSnapshot {
    height: u64,
    data: Arc<BTreeMap<Key, Value>>,
}

impl KvRead for MemSnapshot {
    fn get(&self, key: &[u8]) -> Option<Value> {
        self.data.get(key).cloned()
    }
}

impl Snapshot for MemSnapshot {
    fn height(&self) -> u64 {
        self.height
    }
}

/// Store keeping committed state in a shared map and staged block writes in
/// per-height layers.
#[derive(Default)]
pub struct MemStore {
    committed: RwLock<MemSnapshot>,
    pending: Mutex<BTreeMap<u64, Arc<ChangeSet>>>,
}

impl Default for MemSnapshot {
    fn default() -> Self {
        Self {
            height: 0,
            data: Arc::new(BTreeMap::new()),
        }
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store whose committed state at height 0 is `genesis`.
    pub fn with_genesis(genesis: BTreeMap<Key, Value>) -> Self {
        Self {
            committed: RwLock::new(MemSnapshot {
                height: 0,
                data: Arc::new(genesis),
            }),
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn pending_heights(&self) -> Vec<u64> {
        self.pending.lock().keys().copied().collect()
    }
}

fn hash_entries<'a>(entries: impl Iterator<Item = (&'a [u8], &'a [u8])>) -> B256 {
    let mut hasher = Keccak256::new();
    for (key, value) in entries {
        hasher.update((key.len() as u64).to_be_bytes());
        hasher.update(key);
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value);
    }
    hasher.finalize()
}

impl StateStore for MemStore {
    fn snapshot(&self) -> Arc<dyn Snapshot> {
        Arc::new(self.committed.read().clone())
    }

    fn pending_view(&self) -> Arc<dyn Snapshot> {
        // Same lock order as commit_pending_writes: no layer can move into
        // committed state between the two reads.
        let committed = self.committed.read();
        let pending = self.pending.lock();
        let mut view = LayeredView::new(Arc::new(MemSnapshot::clone(&committed)));
        for (height, layer) in pending.iter() {
            view.push(*height, layer.clone());
        }
        Arc::new(view)
    }

    fn write_pending(&self, height: u64, changes: ChangeSet) {
        self.pending.lock().insert(height, Arc::new(changes));
    }

    fn discard_pending(&self, height: u64) {
        self.pending.lock().remove(&height);
    }

    fn working_hash(&self) -> B256 {
        let committed = self.committed.read();
        let pending = self.pending.lock();

        let mut merged: BTreeMap<&[u8], &[u8]> = committed
            .data
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        for layer in pending.values() {
            for (key, value) in layer.iter() {
                match value {
                    Some(value) => merged.insert(key.as_slice(), value.as_slice()),
                    None => merged.remove(key.as_slice()),
                };
            }
        }
        hash_entries(merged.into_iter())
    }

    fn commit_pending_writes(&self, height: u64) -> Result<B256, StoreError> {
        let mut committed = self.committed.write();
        if height <= committed.height {
            return Err(StoreError::HeightRegression {
                requested: height,
                committed: committed.height,
            });
        }

        let mut pending = self.pending.lock();
        let remaining = pending.split_off(&(height + 1));
        let ready = std::mem::replace(&mut *pending, remaining);
        drop(pending);

        let data = Arc::make_mut(&mut committed.data);
        let mut writes = 0usize;
        for (_, layer) in ready {
            for (key, value) in layer.iter() {
                writes += 1;
                match value {
                    Some(value) => data.insert(key.clone(), value.clone()),
                    None => data.remove(key),
                };
            }
        }
        committed.height = height;

        let hash = hash_entries(committed.data.iter().map(|(k, v)| (k.as_slice(), v.as_slice())));
        debug!(height, writes, %hash, "committed pending writes");
        Ok(hash)
    }

    fn last_committed_height(&self) -> u64 {
        self.committed.read().height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changes(entries: &[(&str, Option<&str>)]) -> ChangeSet {
        entries
            .iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v.map(|v| v.as_bytes().to_vec())))
            .collect()
    }

    #[test]
    fn test_pending_layers_and_commit() {
        let store = MemStore::new();
        store.write_pending(1, changes(&[("a", Some("1")), ("b", Some("2"))]));
        store.write_pending(2, changes(&[("a", None)]));

        let view = store.pending_view();
        assert_eq!(view.get(b"a"), None);
        assert_eq!(view.get(b"b"), Some(b"2".to_vec()));
        assert_eq!(view.height(), 2);
        assert_eq!(store.snapshot().get(b"b"), None);

        let working = store.working_hash();
        assert_eq!(store.commit_pending_writes(1).map(|_| ()), Ok(()));
        assert_eq!(store.pending_heights(), vec![2]);
        assert_eq!(store.snapshot().get(b"a"), Some(b"1".to_vec()));

        let committed = store.commit_pending_writes(2).expect("commit succeeds");
        assert_eq!(committed, working);
        assert_eq!(store.last_committed_height(), 2);
    }

    #[test]
    fn test_commit_rejects_regression() {
        let store = MemStore::new();
        store.commit_pending_writes(3).expect("commit succeeds");
        assert_eq!(
            store.commit_pending_writes(2),
            Err(StoreError::HeightRegression { requested: 2, committed: 3 })
        );
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_commits() {
        let store = MemStore::new();
        let before = store.snapshot();
        store.write_pending(1, changes(&[("k", Some("v"))]));
        store.commit_pending_writes(1).expect("commit succeeds");

        assert_eq!(before.get(b"k"), None);
        assert_eq!(store.snapshot().get(b"k"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_pending_view_never_misses_a_committing_layer() {
        for round in 0..500u64 {
            let store = Arc::new(MemStore::new());
            store.write_pending(round + 1, changes(&[("x", Some("1"))]));
            let expected_hash = store.working_hash();

            let (misses, wrong_hashes) = std::thread::scope(|scope| {
                let reader = scope.spawn(|| {
                    let mut misses = 0;
                    let mut wrong_hashes = 0;
                    for _ in 0..50 {
                        if store.pending_view().get(b"x").is_none() {
                            misses += 1;
                        }
                        if store.working_hash() != expected_hash {
                            wrong_hashes += 1;
                        }
                    }
                    (misses, wrong_hashes)
                });
                store.commit_pending_writes(round + 1).expect("commit succeeds");
                reader.join().expect("reader finishes")
            });
            assert_eq!((misses, wrong_hashes), (0, 0), "round {round}");
        }
    }
}
