//! Height resequencing between the parallel preprocessor and the
//! sequential executor.

use super::stage::{self, CancelToken};
use super::PreprocessedBlock;
use crossbeam::channel::{Receiver, Sender};
use std::collections::BTreeMap;
use tracing::warn;

/// Buffers items by height and releases them strictly in height order.
#[derive(Debug)]
pub struct Orderer<T> {
    next: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> Orderer<T> {
    pub fn new(first_height: u64) -> Self {
        Self {
            next: first_height,
            pending: BTreeMap::new(),
        }
    }

    pub fn next_height(&self) -> u64 {
        self.next
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Accepts the item for `height` and returns every item that is now
    /// contiguous from the next expected height. Already released or
    /// already buffered heights are dropped.
    pub fn push(&mut self, height: u64, item: T) -> Vec<T> {
        if height < self.next || self.pending.contains_key(&height) {
            warn!(height, next = self.next, "dropping duplicate block");
            return Vec::new();
        }
        self.pending.insert(height, item);

        let mut ready = Vec::new();
        while let Some(item) = self.pending.remove(&self.next) {
            ready.push(item);
            self.next += 1;
        }
        ready
    }
}

pub(super) fn worker(
    first_height: u64,
    input: Receiver<PreprocessedBlock>,
    output: Sender<PreprocessedBlock>,
) -> impl FnOnce(CancelToken) + Send + 'static {
    move |cancel| {
        let mut orderer = Orderer::new(first_height);
        while let Some(block) = stage::recv(&input, &cancel) {
            for ready in orderer.push(block.header.height, block) {
                if !stage::send(&output, ready, &cancel) {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

    #[test]
    fn test_any_interleaving_comes_out_in_order() {
        for seed in 0..50 {
            let mut heights: Vec<u64> = (1..=40).collect();
            heights.shuffle(&mut StdRng::seed_from_u64(seed));

            let mut orderer = Orderer::new(1);
            let mut emitted = Vec::new();
            for height in heights {
                emitted.extend(orderer.push(height, height));
            }
            assert_eq!(emitted, (1..=40).collect::<Vec<_>>(), "seed {seed}");
            assert_eq!(orderer.buffered(), 0);
            assert_eq!(orderer.next_height(), 41);
        }
    }

    #[test]
    fn test_duplicates_are_dropped() {
        let mut orderer = Orderer::new(5);
        assert!(orderer.push(6, "b").is_empty());
        assert!(orderer.push(6, "b2").is_empty());
        assert_eq!(orderer.push(5, "a"), vec!["a", "b"]);
        assert!(orderer.push(5, "a2").is_empty());
        assert_eq!(orderer.next_height(), 7);
    }
}
