use super::Dag;
use crate::error::DagError;
use crate::preprocess::PreparedTx;
use crate::types::{BlockContext, ResourceAccessOperation};
use std::sync::Arc;
use tracing::debug;

/// Supplies the declared operations of a prepared transaction.
pub trait AccessOpsProvider: Send + Sync {
    /// `Err(DagError::Unschedulable)` when the transaction's effects cannot
    /// be described by declared operations.
    fn access_ops(&self, tx: &PreparedTx) -> Result<Vec<ResourceAccessOperation>, DagError>;
}

/// Drops repeated operations (first occurrence kept) and terminates the list
/// with a commit.
pub fn normalize_ops(ops: Vec<ResourceAccessOperation>) -> Vec<ResourceAccessOperation> {
    let mut normalized: Vec<ResourceAccessOperation> = Vec::with_capacity(ops.len() + 1);
    for op in ops {
        if op.is_commit() || normalized.contains(&op) {
            continue;
        }
        normalized.push(op);
    }
    normalized.push(ResourceAccessOperation::commit());
    normalized
}

pub struct DependencyGraphBuilder {
    provider: Arc<dyn AccessOpsProvider>,
}

impl DependencyGraphBuilder {
    pub fn new(provider: Arc<dyn AccessOpsProvider>) -> Self {
        Self { provider }
    }

    /// Builds the graph for `txs` in block order.
    ///
    /// The result depends only on the transactions and their declared
    /// operations.
    pub fn build(&self, ctx: &BlockContext, txs: &[PreparedTx]) -> Result<Dag, DagError> {
        let mut dag = Dag::new();
        for (tx_index, tx) in txs.iter().enumerate() {
            let ops = self.provider.access_ops(tx).inspect_err(|err| {
                debug!(height = ctx.height, tx_index, %err, "batch not schedulable");
            })?;
            for op in normalize_ops(ops) {
                dag.add_node_with_dependency(tx_index, op);
            }
        }
        dag.check_acyclic()?;
        debug!(
            height = ctx.height,
            txs = txs.len(),
            nodes = dag.nodes().len(),
            edges = dag.edges().len(),
            "dependency graph built"
        );
        Ok(dag)
    }
}
