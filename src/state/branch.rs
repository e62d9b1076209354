use super::{ChangeSet, Key, KvRead, KvStore, Value};

/// Copy-on-write overlay over a read-only parent.
///
/// Dropping a branch discards its writes; [`Branch::into_changes`] hands them
/// to the parent.
#[derive(Debug)]
pub struct Branch<'a, R: ?Sized> {
    parent: &'a R,
    changes: ChangeSet,
}

impl<'a, R: KvRead + ?Sized> Branch<'a, R> {
    pub fn new(parent: &'a R) -> Self {
        Self::with_changes(parent, ChangeSet::new())
    }

    /// Resumes a branch from previously collected changes.
    pub fn with_changes(parent: &'a R, changes: ChangeSet) -> Self {
        Self { parent, changes }
    }

    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    pub fn into_changes(self) -> ChangeSet {
        self.changes
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

impl<R: KvRead + ?Sized> KvRead for Branch<'_, R> {
    fn get(&self, key: &[u8]) -> Option<Value> {
        match self.changes.get(key) {
            Some(value) => value.clone(),
            None => self.parent.get(key),
        }
    }
}

impl<R: KvRead + ?Sized> KvStore for Branch<'_, R> {
    fn set(&mut self, key: Key, value: Value) {
        self.changes.insert(key, Some(value));
    }

    fn delete(&mut self, key: &[u8]) {
        self.changes.insert(key.to_vec(), None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct Base(BTreeMap<Vec<u8>, Vec<u8>>);

    impl KvRead for Base {
        fn get(&self, key: &[u8]) -> Option<Value> {
            self.0.get(key).cloned()
        }
    }

    #[test]
    fn test_nested_branch_discard_and_merge() {
        let base = Base(BTreeMap::from([(b"a".to_vec(), b"1".to_vec())]));
        let mut outer = Branch::new(&base);
        outer.set(b"b".to_vec(), b"2".to_vec());

        {
            let mut inner = Branch::new(&outer);
            inner.delete(b"a");
            assert_eq!(inner.get(b"a"), None);
            // Dropped without merging.
        }
        assert_eq!(outer.get(b"a"), Some(b"1".to_vec()));

        let mut inner = Branch::new(&outer);
        inner.delete(b"a");
        let changes = inner.into_changes();
        outer.apply(changes);

        assert_eq!(outer.get(b"a"), None);
        assert_eq!(outer.get(b"b"), Some(b"2".to_vec()));
        assert_eq!(base.get(b"a"), Some(b"1".to_vec()));
    }
}
