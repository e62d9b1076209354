use super::{ChangeSet, KvRead, Snapshot, Value};
use std::sync::Arc;

/// A base snapshot with uncommitted change sets stacked on top.
///
/// Layers are applied in order; the last layer wins.
pub struct LayeredView {
    base: Arc<dyn Snapshot>,
    layers: Vec<Arc<ChangeSet>>,
    height: u64,
}

impl LayeredView {
    pub fn new(base: Arc<dyn Snapshot>) -> Self {
        let height = base.height();
        Self {
            base,
            layers: Vec::new(),
            height,
        }
    }

    /// Adds the writes of block `height` on top of the current layers.
    pub fn push(&mut self, height: u64, layer: Arc<ChangeSet>) {
        self.layers.push(layer);
        self.height = self.height.max(height);
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }
}

impl KvRead for LayeredView {
    fn get(&self, key: &[u8]) -> Option<Value> {
        for layer in self.layers.iter().rev() {
            if let Some(value) = layer.get(key) {
                return value.clone();
            }
        }
        self.base.get(key)
    }
}

impl Snapshot for LayeredView {
    fn height(&self) -> u64 {
        self.height
    }
}
