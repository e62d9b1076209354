//! Resource-access dependency graph.
//!
//! One node per declared operation, in arrival order. Edges point from the
//! operation that must finish first to the one waiting on it; all edges go
//! from a lower (or equal) transaction index to a higher one.

mod builder;
mod signals;

pub use builder::{AccessOpsProvider, DependencyGraphBuilder};
pub use signals::{BlockingSignal, CompletionSignal, SignalMaps};

use crate::error::DagError;
use crate::types::{AccessType, ResourceAccessOperation, ResourceType, WILDCARD};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

pub type NodeId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DagNode {
    pub node_id: NodeId,
    pub tx_index: usize,
    pub access_op: ResourceAccessOperation,
}

/// `to` waits for `from`. `blocking_op` is `None` for the ordering edge
/// between consecutive operations of one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DagEdge {
    pub from: NodeId,
    pub to: NodeId,
    pub blocking_op: Option<ResourceAccessOperation>,
}

type LatestByTx = BTreeMap<usize, NodeId>;

#[derive(Debug, Clone, Default)]
pub struct Dag {
    nodes: Vec<DagNode>,
    edges: Vec<DagEdge>,
    outgoing: Vec<Vec<usize>>,
    tx_nodes: BTreeMap<usize, Vec<NodeId>>,
    /// Latest node per transaction, by access type, resource and identifier.
    latest: BTreeMap<(AccessType, ResourceType), BTreeMap<String, LatestByTx>>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[DagNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[DagEdge] {
        &self.edges
    }

    pub fn node(&self, id: NodeId) -> Option<&DagNode> {
        self.nodes.get(id)
    }

    pub fn nodes_for_tx(&self, tx_index: usize) -> &[NodeId] {
        self.tx_nodes.get(&tx_index).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn tx_count(&self) -> usize {
        self.tx_nodes.len()
    }

    /// Adds the node for `op` of `tx_index` with its incoming edges.
    ///
    /// Reads wait on the latest overlapping writes of every earlier
    /// transaction; writes wait on the latest overlapping reads and writes.
    /// The index of latest operations is updated only after the edges exist.
    pub fn add_node_with_dependency(&mut self, tx_index: usize, op: ResourceAccessOperation) -> NodeId {
        let node_id = self.nodes.len();
        self.nodes.push(DagNode {
            node_id,
            tx_index,
            access_op: op.clone(),
        });
        self.outgoing.push(Vec::new());

        let tx_nodes = self.tx_nodes.entry(tx_index).or_default();
        let previous = tx_nodes.last().copied();
        tx_nodes.push(node_id);
        if let Some(previous) = previous {
            self.push_edge(previous, node_id, None);
        }

        let blockers: &[AccessType] = match op.access_type {
            AccessType::Read => &[AccessType::Write],
            AccessType::Write => &[AccessType::Write, AccessType::Read],
            AccessType::Commit => &[],
        };
        let mut dependencies = BTreeSet::new();
        for &blocker in blockers {
            self.collect_latest(blocker, &op, tx_index, &mut dependencies);
        }
        for from in dependencies {
            let blocking_op = self.nodes[from].access_op.clone();
            self.push_edge(from, node_id, Some(blocking_op));
        }

        if !op.is_commit() {
            self.latest
                .entry((op.access_type, op.resource_type.clone()))
                .or_default()
                .entry(op.identifier_template.clone())
                .or_default()
                .insert(tx_index, node_id);
        }
        node_id
    }

    fn collect_latest(
        &self,
        access: AccessType,
        op: &ResourceAccessOperation,
        tx_index: usize,
        out: &mut BTreeSet<NodeId>,
    ) {
        for ((kind, resource), by_identifier) in &self.latest {
            if *kind != access || !resource.is_related(&op.resource_type) {
                continue;
            }
            let exact_type = *resource == op.resource_type;
            for (identifier, by_tx) in by_identifier {
                let matches = !exact_type
                    || identifier == &op.identifier_template
                    || identifier == WILDCARD
                    || op.identifier_template == WILDCARD;
                if matches {
                    out.extend(by_tx.range(..tx_index).map(|(_, node)| *node));
                }
            }
        }
    }

    fn push_edge(&mut self, from: NodeId, to: NodeId, blocking_op: Option<ResourceAccessOperation>) {
        self.outgoing[from].push(self.edges.len());
        self.edges.push(DagEdge {
            from,
            to,
            blocking_op,
        });
    }

    /// Adds an arbitrary edge. Returns false if either node does not exist.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId, blocking_op: Option<ResourceAccessOperation>) -> bool {
        if from >= self.nodes.len() || to >= self.nodes.len() {
            return false;
        }
        self.push_edge(from, to, blocking_op);
        true
    }

    /// Kahn's algorithm over every node and edge.
    pub fn is_acyclic(&self) -> bool {
        let mut in_degree = vec![0usize; self.nodes.len()];
        for edge in &self.edges {
            in_degree[edge.to] += 1;
        }
        let mut queue: VecDeque<NodeId> = (0..self.nodes.len()).filter(|&n| in_degree[n] == 0).collect();
        let mut visited = 0;
        while let Some(node) = queue.pop_front() {
            visited += 1;
            for &edge in &self.outgoing[node] {
                let to = self.edges[edge].to;
                in_degree[to] -= 1;
                if in_degree[to] == 0 {
                    queue.push_back(to);
                }
            }
        }
        visited == self.nodes.len()
    }

    pub fn check_acyclic(&self) -> Result<(), DagError> {
        if self.is_acyclic() {
            Ok(())
        } else {
            Err(DagError::Cycle)
        }
    }

    /// True if some node of `from_tx` reaches some node of `to_tx`.
    pub fn has_path(&self, from_tx: usize, to_tx: usize) -> bool {
        let targets: BTreeSet<NodeId> = self.nodes_for_tx(to_tx).iter().copied().collect();
        let mut seen = vec![false; self.nodes.len()];
        let mut stack: Vec<NodeId> = self.nodes_for_tx(from_tx).to_vec();
        while let Some(node) = stack.pop() {
            if std::mem::replace(&mut seen[node], true) {
                continue;
            }
            for &edge in &self.outgoing[node] {
                let to = self.edges[edge].to;
                if targets.contains(&to) {
                    return true;
                }
                stack.push(to);
            }
        }
        false
    }

    /// Earlier transactions `tx_index` has a direct data dependency on.
    pub fn dependencies_of(&self, tx_index: usize) -> BTreeSet<usize> {
        self.edges
            .iter()
            .filter(|edge| edge.blocking_op.is_some() && self.nodes[edge.to].tx_index == tx_index)
            .map(|edge| self.nodes[edge.from].tx_index)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(id: &str) -> ResourceAccessOperation {
        ResourceAccessOperation::write("bank/balances", id)
    }

    fn read(id: &str) -> ResourceAccessOperation {
        ResourceAccessOperation::read("bank/balances", id)
    }

    #[test]
    fn test_raw_waw_war_edges() {
        let mut dag = Dag::new();
        dag.add_node_with_dependency(0, write("a"));
        dag.add_node_with_dependency(1, read("a"));
        dag.add_node_with_dependency(2, write("a"));
        dag.add_node_with_dependency(3, read("b"));

        assert!(dag.has_path(0, 1));
        assert!(dag.has_path(1, 2));
        assert!(dag.has_path(0, 2));
        assert!(!dag.has_path(0, 3));
        assert_eq!(dag.dependencies_of(2), BTreeSet::from([0, 1]));
        assert_eq!(dag.dependencies_of(1), BTreeSet::from([0]));
        assert!(dag.is_acyclic());
    }

    #[test]
    fn test_reads_do_not_depend_on_reads() {
        let mut dag = Dag::new();
        dag.add_node_with_dependency(0, read("a"));
        dag.add_node_with_dependency(1, read("a"));
        assert!(dag.dependencies_of(1).is_empty());
    }

    #[test]
    fn test_same_tx_edges_are_ordering_only() {
        let mut dag = Dag::new();
        let first = dag.add_node_with_dependency(0, write("a"));
        let second = dag.add_node_with_dependency(0, read("a"));

        assert_eq!(
            dag.edges(),
            &[DagEdge {
                from: first,
                to: second,
                blocking_op: None
            }]
        );
    }

    #[test]
    fn test_wildcard_and_parent_resources_conflict() {
        let mut dag = Dag::new();
        dag.add_node_with_dependency(0, write("a"));
        dag.add_node_with_dependency(1, read(WILDCARD));
        dag.add_node_with_dependency(2, ResourceAccessOperation::read("bank", "x"));
        dag.add_node_with_dependency(3, ResourceAccessOperation::read("oracle/votes", "a"));

        assert_eq!(dag.dependencies_of(1), BTreeSet::from([0]));
        assert_eq!(dag.dependencies_of(2), BTreeSet::from([0]));
        assert!(dag.dependencies_of(3).is_empty());
    }

    #[test]
    fn test_commit_nodes_have_no_cross_tx_edges() {
        let mut dag = Dag::new();
        dag.add_node_with_dependency(0, write("a"));
        dag.add_node_with_dependency(0, ResourceAccessOperation::commit());
        dag.add_node_with_dependency(1, ResourceAccessOperation::commit());
        assert!(dag.dependencies_of(1).is_empty());
        assert_eq!(dag.edges().len(), 1);
    }

    #[test]
    fn test_cycle_detected() {
        let mut dag = Dag::new();
        let a = dag.add_node_with_dependency(0, write("a"));
        let b = dag.add_node_with_dependency(1, write("a"));
        assert!(dag.is_acyclic());

        assert!(dag.add_edge(b, a, None));
        assert!(!dag.is_acyclic());
        assert_eq!(dag.check_acyclic(), Err(DagError::Cycle));
        assert!(!dag.add_edge(a, 99, None));
    }

    #[test]
    fn test_latest_index_updated_after_edges() {
        // Both writes of tx 1 depend on tx 0 only, never on tx 1 itself.
        let mut dag = Dag::new();
        let w0 = dag.add_node_with_dependency(0, write("a"));
        let w1 = dag.add_node_with_dependency(1, write("a"));
        let w1b = dag.add_node_with_dependency(1, write("a"));

        let cross: Vec<_> = dag.edges().iter().filter(|e| e.blocking_op.is_some()).collect();
        assert_eq!(cross.len(), 2);
        assert!(cross.iter().all(|e| e.from == w0));
        assert!(cross.iter().any(|e| e.to == w1) && cross.iter().any(|e| e.to == w1b));
    }
}
