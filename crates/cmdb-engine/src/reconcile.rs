//! Re-derive the whole Graph Index from the Primary Store.

use chrono::{DateTime, Utc};
use serde::Serialize;

use cmdb_core::Result;
use cmdb_graph::{GraphEdge, GraphIndex, GraphNode};

use crate::mirror::MirrorGate;
use crate::store::PrimaryStore;

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ReconcileReport {
    pub nodes: usize,
    pub edges: usize,
    pub cleared_outbox: u64,
}

/// Rebuild the mirror and acknowledge the outbox entries it supersedes.
///
/// Only entries that existed before the rebuild read the store are
/// acknowledged. Anything committed meanwhile stays queued and is replayed
/// by the mirror worker once `gate` is released; no mirror application can
/// run between the store read and the rebuild.
pub async fn reconcile(
    store: &dyn PrimaryStore,
    graph: &dyn GraphIndex,
    gate: &MirrorGate,
) -> Result<ReconcileReport> {
    let _gate = gate.exclusive().await;
    let superseded = store
        .pending_outbox(DateTime::<Utc>::MAX_UTC, usize::MAX)
        .await?;

    let nodes: Vec<GraphNode> = store.all_cis().await?.iter().map(GraphNode::from).collect();
    let edges: Vec<GraphEdge> = store
        .all_relationships()
        .await?
        .iter()
        .map(GraphEdge::from)
        .collect();
    let report_nodes = nodes.len();
    let report_edges = edges.len();

    graph.rebuild(nodes, edges).await?;

    for entry in &superseded {
        store.ack_outbox(entry.id).await?;
    }

    let report = ReconcileReport {
        nodes: report_nodes,
        edges: report_edges,
        cleared_outbox: superseded.len() as u64,
    };
    tracing::info!(
        nodes = report.nodes,
        edges = report.edges,
        cleared_outbox = report.cleared_outbox,
        "Graph index reconciled"
    );
    Ok(report)
}
