use super::{Dag, NodeId};
use crate::types::ResourceAccessOperation;
use crossbeam::channel::{bounded, Receiver, Sender};
use std::collections::BTreeMap;

/// Completion side of one cross-transaction edge, held by the earlier
/// transaction.
#[derive(Debug)]
pub struct CompletionSignal {
    pub from_node: NodeId,
    pub to_tx: usize,
    pub op: ResourceAccessOperation,
    sender: Sender<()>,
}

impl CompletionSignal {
    /// Marks the blocking operation done. Never blocks.
    pub fn signal(&self) {
        let _ = self.sender.try_send(());
    }
}

/// Waiting side of one cross-transaction edge, held by the later
/// transaction.
#[derive(Debug)]
pub struct BlockingSignal {
    pub to_node: NodeId,
    pub from_tx: usize,
    pub op: ResourceAccessOperation,
    receiver: Receiver<()>,
}

impl BlockingSignal {
    /// Blocks until the earlier transaction signals. Returns false if it was
    /// dropped without signalling.
    pub fn wait(&self) -> bool {
        self.receiver.recv().is_ok()
    }
}

/// Per-transaction signals derived from a [`Dag`], in edge order.
#[derive(Debug, Default)]
pub struct SignalMaps {
    /// Signals a transaction raises once it has run.
    pub completion: BTreeMap<usize, Vec<CompletionSignal>>,
    /// Signals a transaction waits on before it runs.
    pub blocking: BTreeMap<usize, Vec<BlockingSignal>>,
}

impl SignalMaps {
    pub fn take_completion(&mut self, tx_index: usize) -> Vec<CompletionSignal> {
        self.completion.remove(&tx_index).unwrap_or_default()
    }

    pub fn take_blocking(&mut self, tx_index: usize) -> Vec<BlockingSignal> {
        self.blocking.remove(&tx_index).unwrap_or_default()
    }
}

impl Dag {
    /// One fresh one-shot channel per cross-transaction edge.
    pub fn build_completion_signal_maps(&self) -> SignalMaps {
        let mut maps = SignalMaps::default();
        for edge in self.edges() {
            let Some(op) = &edge.blocking_op else {
                continue;
            };
            let from_tx = self.nodes()[edge.from].tx_index;
            let to_tx = self.nodes()[edge.to].tx_index;
            let (sender, receiver) = bounded(1);

            maps.completion.entry(from_tx).or_default().push(CompletionSignal {
                from_node: edge.from,
                to_tx,
                op: op.clone(),
                sender,
            });
            maps.blocking.entry(to_tx).or_default().push(BlockingSignal {
                to_node: edge.to,
                from_tx,
                op: op.clone(),
                receiver,
            });
        }
        maps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_maps_follow_edges() {
        let mut dag = Dag::new();
        dag.add_node_with_dependency(0, ResourceAccessOperation::write("bank/balances", "a"));
        dag.add_node_with_dependency(1, ResourceAccessOperation::read("bank/balances", "a"));
        dag.add_node_with_dependency(2, ResourceAccessOperation::read("bank/balances", "b"));

        let mut maps = dag.build_completion_signal_maps();
        let done = maps.take_completion(0);
        let waits = maps.take_blocking(1);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].to_tx, 1);
        assert_eq!(waits.len(), 1);
        assert_eq!(waits[0].from_tx, 0);
        assert!(maps.take_blocking(2).is_empty());

        done[0].signal();
        assert!(waits[0].wait());
    }

    #[test]
    fn test_dropped_completion_reports_failure() {
        let mut dag = Dag::new();
        dag.add_node_with_dependency(0, ResourceAccessOperation::write("bank/balances", "a"));
        dag.add_node_with_dependency(1, ResourceAccessOperation::write("bank/balances", "a"));

        let mut maps = dag.build_completion_signal_maps();
        drop(maps.take_completion(0));
        assert!(!maps.take_blocking(1)[0].wait());
    }
}
