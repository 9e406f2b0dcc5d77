//! Write operations for the Neo4j graph index.
//!
//! All mutations use MERGE (upsert) semantics so that replaying a mirror
//! operation is harmless. Nodes are `:ConfigurationItem` identified by `id`;
//! edges are `[:RELATES_TO]` identified by their own `id`.

use neo4rs::{query, Query};

use cmdb_core::{CiId, RelationshipId};

use crate::client::{GraphClient, GraphError};
use crate::model::{GraphEdge, GraphNode};

impl GraphClient {
    // ── Node Writes ──────────────────────────────────────────────

    /// Upsert a CI node.
    pub async fn merge_ci_node(&self, node: &GraphNode) -> Result<(), GraphError> {
        self.run(node_merge_query(node)?).await
    }

    /// Delete a CI node together with every relationship touching it.
    pub async fn detach_delete_ci(&self, id: CiId) -> Result<(), GraphError> {
        let q = query("MATCH (n:ConfigurationItem {id: $id}) DETACH DELETE n")
            .param("id", id.to_string());
        self.run(q).await
    }

    // ── Edge Writes ──────────────────────────────────────────────

    /// Upsert a relationship edge. Fails when either endpoint node is absent.
    pub async fn merge_relationship_edge(&self, edge: &GraphEdge) -> Result<(), GraphError> {
        let matched = match self.query_one(edge_merge_query(edge)?).await? {
            Some(row) => row.get::<i64>("cnt").unwrap_or(0),
            None => 0,
        };
        if matched == 0 {
            return Err(GraphError::NotFound {
                entity: "relationship endpoint",
                id: format!("{} -> {}", edge.source, edge.target),
            });
        }
        Ok(())
    }

    pub async fn delete_relationship_edge(&self, id: RelationshipId) -> Result<(), GraphError> {
        let q = query("MATCH ()-[r:RELATES_TO {id: $id}]->() DELETE r").param("id", id.to_string());
        self.run(q).await
    }

    // ── Bulk ─────────────────────────────────────────────────────

    /// Replace the whole mirror in a single transaction.
    pub async fn replace_all(
        &self,
        nodes: &[GraphNode],
        edges: &[GraphEdge],
    ) -> Result<(), GraphError> {
        let mut txn = self.start_txn().await?;

        txn.run(query("MATCH (n:ConfigurationItem) DETACH DELETE n"))
            .await?;
        for node in nodes {
            txn.run(node_merge_query(node)?).await?;
        }
        for edge in edges {
            txn.run(edge_merge_query(edge)?).await?;
        }

        txn.commit().await?;
        tracing::info!(
            nodes = nodes.len(),
            edges = edges.len(),
            "Rebuilt Neo4j graph index"
        );
        Ok(())
    }
}

// ── Query Builders ───────────────────────────────────────────────

fn node_merge_query(node: &GraphNode) -> Result<Query, GraphError> {
    let q = query(
        "MERGE (n:ConfigurationItem {id: $id})
         SET n.name = $name, n.type = $type, n.attributes = $attributes,
             n.tags = $tags, n.created_by = $created_by,
             n.created_at = $created_at, n.updated_at = $updated_at",
    )
    .param("id", node.id.to_string())
    .param("name", node.name.clone())
    .param("type", node.ci_type.clone())
    .param("attributes", to_json(&node.attributes)?)
    .param("tags", node.tags.iter().cloned().collect::<Vec<String>>())
    .param("created_by", node.created_by.to_string())
    .param("created_at", node.created_at.to_rfc3339())
    .param("updated_at", node.updated_at.to_rfc3339());
    Ok(q)
}

fn edge_merge_query(edge: &GraphEdge) -> Result<Query, GraphError> {
    let q = query(
        "MATCH (a:ConfigurationItem {id: $source_id})
         MATCH (b:ConfigurationItem {id: $target_id})
         MERGE (a)-[r:RELATES_TO {id: $id}]->(b)
         SET r.type = $type, r.attributes = $attributes,
             r.created_by = $created_by, r.created_at = $created_at
         RETURN count(r) AS cnt",
    )
    .param("source_id", edge.source.to_string())
    .param("target_id", edge.target.to_string())
    .param("id", edge.id.to_string())
    .param("type", edge.relationship_type.clone())
    .param("attributes", to_json(&edge.attributes)?)
    .param("created_by", edge.created_by.to_string())
    .param("created_at", edge.created_at.to_rfc3339());
    Ok(q)
}

fn to_json<T: serde::Serialize>(val: &T) -> Result<String, GraphError> {
    serde_json::to_string(val).map_err(|e| GraphError::Serialization(e.to_string()))
}
