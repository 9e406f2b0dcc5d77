//! Embedded graph index held in process memory.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use cmdb_core::{CiId, RelationshipId};

use crate::algorithms;
use crate::client::GraphError;
use crate::graph::InMemoryGraph;
use crate::index::GraphIndex;
use crate::model::{
    CiNetwork, Connectivity, GraphData, GraphEdge, GraphFilter, GraphNode, ImpactAnalysis,
    RelationshipEdge, TypeUsage, MAX_CYCLES,
};

#[derive(Default)]
struct Mirror {
    nodes: HashMap<CiId, GraphNode>,
    edges: HashMap<RelationshipId, GraphEdge>,
}

impl Mirror {
    fn snapshot(&self) -> InMemoryGraph {
        InMemoryGraph::from_snapshot(
            self.nodes.values().cloned().collect(),
            self.edges.values().cloned().collect(),
        )
    }
}

/// Graph index kept in maps under an async `RwLock`.
///
/// Queries build a fresh [`InMemoryGraph`] from the mirror and run the shared
/// algorithms over it, so results match the Neo4j realization.
#[derive(Default)]
pub struct MemoryGraphIndex {
    inner: RwLock<Mirror>,
}

impl MemoryGraphIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn node_count(&self) -> usize {
        self.inner.read().await.nodes.len()
    }

    pub async fn edge_count(&self) -> usize {
        self.inner.read().await.edges.len()
    }

    pub async fn contains_node(&self, id: CiId) -> bool {
        self.inner.read().await.nodes.contains_key(&id)
    }

    pub async fn contains_edge(&self, id: RelationshipId) -> bool {
        self.inner.read().await.edges.contains_key(&id)
    }
}

#[async_trait]
impl GraphIndex for MemoryGraphIndex {
    async fn upsert_node(&self, node: &GraphNode) -> Result<(), GraphError> {
        self.inner.write().await.nodes.insert(node.id, node.clone());
        Ok(())
    }

    async fn delete_node(&self, id: CiId) -> Result<(), GraphError> {
        let mut mirror = self.inner.write().await;
        mirror.nodes.remove(&id);
        mirror.edges.retain(|_, e| e.source != id && e.target != id);
        Ok(())
    }

    async fn upsert_edge(&self, edge: &GraphEdge) -> Result<(), GraphError> {
        let mut mirror = self.inner.write().await;
        for endpoint in [edge.source, edge.target] {
            if !mirror.nodes.contains_key(&endpoint) {
                return Err(GraphError::ci_not_found(endpoint));
            }
        }
        mirror.edges.insert(edge.id, edge.clone());
        Ok(())
    }

    async fn delete_edge(&self, id: RelationshipId) -> Result<(), GraphError> {
        self.inner.write().await.edges.remove(&id);
        Ok(())
    }

    async fn rebuild(&self, nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) -> Result<(), GraphError> {
        let nodes: HashMap<CiId, GraphNode> = nodes.into_iter().map(|n| (n.id, n)).collect();
        let edges = edges
            .into_iter()
            .filter(|e| nodes.contains_key(&e.source) && nodes.contains_key(&e.target))
            .map(|e| (e.id, e))
            .collect();
        let fresh = Mirror { nodes, edges };

        tracing::info!(
            nodes = fresh.nodes.len(),
            edges = fresh.edges.len(),
            "Rebuilt embedded graph index"
        );
        *self.inner.write().await = fresh;
        Ok(())
    }

    async fn relationship_count(&self, id: CiId) -> Result<usize, GraphError> {
        let mirror = self.inner.read().await;
        Ok(mirror
            .edges
            .values()
            .filter(|e| e.source == id || e.target == id)
            .count())
    }

    async fn neighbors(&self, id: CiId) -> Result<Vec<RelationshipEdge>, GraphError> {
        let graph = self.inner.read().await.snapshot();
        let node = graph.index_of(&id).ok_or_else(|| GraphError::ci_not_found(id))?;
        Ok(algorithms::neighbors(&graph, node))
    }

    async fn subgraph(&self, filter: &GraphFilter) -> Result<GraphData, GraphError> {
        let graph = self.inner.read().await.snapshot();
        Ok(algorithms::subgraph(&graph, filter))
    }

    async fn network(&self, id: CiId, depth: usize) -> Result<CiNetwork, GraphError> {
        let graph = self.inner.read().await.snapshot();
        let center = graph.index_of(&id).ok_or_else(|| GraphError::ci_not_found(id))?;
        Ok(algorithms::network(&graph, center, depth))
    }

    async fn find_cycles(&self) -> Result<Vec<Vec<CiId>>, GraphError> {
        let graph = self.inner.read().await.snapshot();
        Ok(algorithms::find_cycles(&graph, MAX_CYCLES))
    }

    async fn impact_analysis(&self, id: CiId) -> Result<ImpactAnalysis, GraphError> {
        let graph = self.inner.read().await.snapshot();
        let node = graph.index_of(&id).ok_or_else(|| GraphError::ci_not_found(id))?;
        Ok(algorithms::impact_analysis(&graph, node))
    }

    async fn most_connected(&self, limit: usize) -> Result<Vec<Connectivity>, GraphError> {
        let graph = self.inner.read().await.snapshot();
        Ok(algorithms::most_connected(&graph, limit))
    }

    async fn type_usage(&self) -> Result<Vec<TypeUsage>, GraphError> {
        let mirror = self.inner.read().await;
        Ok(algorithms::type_usage(mirror.nodes.values()))
    }
}
