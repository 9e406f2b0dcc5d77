//! The graph index contract.

use async_trait::async_trait;

use cmdb_core::{CiId, RelationshipId};

use crate::client::GraphError;
use crate::model::{
    CiNetwork, Connectivity, GraphData, GraphEdge, GraphFilter, GraphNode, ImpactAnalysis,
    RelationshipEdge, TypeUsage,
};

/// A derived, eventually consistent projection of CIs and relationships.
///
/// Writes are idempotent: upserting an existing node or edge replaces its
/// properties, deleting an absent one succeeds. Deleting a node also drops
/// every edge touching it.
#[async_trait]
pub trait GraphIndex: Send + Sync {
    async fn upsert_node(&self, node: &GraphNode) -> Result<(), GraphError>;

    async fn delete_node(&self, id: CiId) -> Result<(), GraphError>;

    /// Fails with `NotFound` when either endpoint is not mirrored yet.
    async fn upsert_edge(&self, edge: &GraphEdge) -> Result<(), GraphError>;

    async fn delete_edge(&self, id: RelationshipId) -> Result<(), GraphError>;

    /// Replace the whole mirror with the given nodes and edges.
    async fn rebuild(&self, nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) -> Result<(), GraphError>;

    /// Number of edges touching `id` in either direction; 0 when the CI is not mirrored.
    async fn relationship_count(&self, id: CiId) -> Result<usize, GraphError>;

    async fn neighbors(&self, id: CiId) -> Result<Vec<RelationshipEdge>, GraphError>;

    async fn subgraph(&self, filter: &GraphFilter) -> Result<GraphData, GraphError>;

    async fn network(&self, id: CiId, depth: usize) -> Result<CiNetwork, GraphError>;

    async fn find_cycles(&self) -> Result<Vec<Vec<CiId>>, GraphError>;

    async fn impact_analysis(&self, id: CiId) -> Result<ImpactAnalysis, GraphError>;

    async fn most_connected(&self, limit: usize) -> Result<Vec<Connectivity>, GraphError>;

    async fn type_usage(&self) -> Result<Vec<TypeUsage>, GraphError>;
}
