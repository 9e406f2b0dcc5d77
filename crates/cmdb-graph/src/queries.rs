//! Read operations for the Neo4j graph index.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use neo4rs::query;

use cmdb_core::{Attributes, CiId};

use crate::algorithms::dedupe_edges;
use crate::client::{GraphClient, GraphError};
use crate::model::{
    Connectivity, EdgeDirection, GraphData, GraphEdge, GraphFilter, GraphNode, RelationshipEdge,
    TypeUsage,
};

impl GraphClient {
    // ── Lookups ──────────────────────────────────────────────────

    pub async fn ci_exists(&self, id: CiId) -> Result<bool, GraphError> {
        let q = query("MATCH (n:ConfigurationItem {id: $id}) RETURN count(n) AS cnt")
            .param("id", id.to_string());
        Ok(self.scalar_count(q).await? > 0)
    }

    /// Relationships touching a CI in either direction.
    pub async fn count_ci_relationships(&self, id: CiId) -> Result<usize, GraphError> {
        let q = query(
            "MATCH (n:ConfigurationItem {id: $id})-[r:RELATES_TO]-(:ConfigurationItem)
             RETURN count(DISTINCT r) AS cnt",
        )
        .param("id", id.to_string());
        Ok(self.scalar_count(q).await?.max(0) as usize)
    }

    // ── Neighbour Queries ────────────────────────────────────────

    /// Every relationship touching a CI, joined with the CI on the other end.
    pub async fn ci_relationships(&self, id: CiId) -> Result<Vec<RelationshipEdge>, GraphError> {
        let q = query(
            "MATCH (c:ConfigurationItem {id: $id})-[r:RELATES_TO]->(o:ConfigurationItem)
             RETURN r, o, 'outgoing' AS direction
             UNION ALL
             MATCH (c:ConfigurationItem {id: $id})<-[r:RELATES_TO]-(o:ConfigurationItem)
             RETURN r, o, 'incoming' AS direction",
        )
        .param("id", id.to_string());

        let rows = self.query_rows(q).await?;
        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let rel: neo4rs::Relation = row
                .get("r")
                .map_err(|e| GraphError::Serialization(format!("Failed to get relation: {e}")))?;
            let other: neo4rs::Node = row.get("o").map_err(|e| {
                GraphError::Serialization(format!("Failed to get neighbor node: {e}"))
            })?;
            let direction = match row.get::<String>("direction").unwrap_or_default().as_str() {
                "incoming" => EdgeDirection::Incoming,
                _ => EdgeDirection::Outgoing,
            };

            let related_ci = node_from_neo4j(&other)?;
            let (source, target) = match direction {
                EdgeDirection::Outgoing => (id, related_ci.id),
                EdgeDirection::Incoming => (related_ci.id, id),
            };
            let edge = edge_from_neo4j(&rel, source, target)?;

            results.push(RelationshipEdge {
                id: edge.id,
                relationship_type: edge.relationship_type,
                attributes: edge.attributes,
                created_by: edge.created_by,
                created_at: edge.created_at,
                direction,
                related_ci,
            });
        }

        results.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(results)
    }

    // ── Subgraph Queries ─────────────────────────────────────────

    /// Nodes matching the filter (name order, bounded) plus the edges among them.
    pub async fn graph_data(&self, filter: &GraphFilter) -> Result<GraphData, GraphError> {
        let search = filter
            .search
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        let q = query(
            "MATCH (n:ConfigurationItem)
             WHERE (size($types) = 0 OR n.type IN $types)
               AND ($search = '' OR toLower(n.name) CONTAINS toLower($search))
             RETURN n
             ORDER BY n.name, n.id
             LIMIT $limit",
        )
        .param("types", filter.ci_types.clone())
        .param("search", search)
        .param("limit", filter.limit as i64);

        let nodes = self.collect_nodes(q, "n").await?;
        let ids: Vec<String> = nodes.iter().map(|n| n.id.to_string()).collect();

        let q = query(
            "MATCH (a:ConfigurationItem)-[r:RELATES_TO]->(b:ConfigurationItem)
             WHERE a.id IN $ids AND b.id IN $ids
             RETURN r, a.id AS source, b.id AS target
             ORDER BY r.created_at, r.id",
        )
        .param("ids", ids);
        let edges = dedupe_edges(self.collect_edges(q).await?);

        Ok(GraphData { nodes, edges })
    }

    /// The whole mirror, for algorithms that run in memory.
    pub async fn fetch_snapshot(&self) -> Result<GraphData, GraphError> {
        let nodes = self
            .collect_nodes(query("MATCH (n:ConfigurationItem) RETURN n"), "n")
            .await?;
        let edges = self
            .collect_edges(query(
                "MATCH (a:ConfigurationItem)-[r:RELATES_TO]->(b:ConfigurationItem)
                 RETURN r, a.id AS source, b.id AS target",
            ))
            .await?;
        tracing::debug!(nodes = nodes.len(), edges = edges.len(), "Fetched graph snapshot");
        Ok(GraphData { nodes, edges })
    }

    // ── Aggregates ───────────────────────────────────────────────

    pub async fn connectivity_ranking(&self, limit: usize) -> Result<Vec<Connectivity>, GraphError> {
        let q = query(
            "MATCH (n:ConfigurationItem)-[:RELATES_TO]-(m:ConfigurationItem)
             WHERE n <> m
             WITH n, count(DISTINCT m) AS connections
             RETURN n.id AS id, n.name AS name, n.type AS type, connections
             ORDER BY connections DESC, id ASC
             LIMIT $limit",
        )
        .param("limit", limit as i64);

        let rows = self.query_rows(q).await?;
        let mut ranked = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id").unwrap_or_default();
            ranked.push(Connectivity {
                id: parse_id(&id)?,
                name: row.get("name").unwrap_or_default(),
                ci_type: row.get("type").unwrap_or_default(),
                connection_count: row.get::<i64>("connections").unwrap_or(0).max(0) as usize,
            });
        }
        Ok(ranked)
    }

    pub async fn ci_type_usage(&self) -> Result<Vec<TypeUsage>, GraphError> {
        let q = query(
            "MATCH (n:ConfigurationItem)
             RETURN n.type AS type, count(n) AS count
             ORDER BY count DESC, type ASC",
        );
        let rows = self.query_rows(q).await?;
        Ok(rows
            .into_iter()
            .map(|row| TypeUsage {
                ci_type: row.get("type").unwrap_or_default(),
                count: row.get::<i64>("count").unwrap_or(0).max(0) as u64,
            })
            .collect())
    }

    // ── Row Helpers ──────────────────────────────────────────────

    async fn scalar_count(&self, q: neo4rs::Query) -> Result<i64, GraphError> {
        match self.query_one(q).await? {
            Some(row) => Ok(row.get::<i64>("cnt").unwrap_or(0)),
            None => Ok(0),
        }
    }

    async fn collect_nodes(
        &self,
        q: neo4rs::Query,
        key: &str,
    ) -> Result<Vec<GraphNode>, GraphError> {
        let rows = self.query_rows(q).await?;
        let mut nodes = Vec::with_capacity(rows.len());
        for row in rows {
            let node: neo4rs::Node = row.get(key).map_err(|e| {
                GraphError::Serialization(format!("Failed to deserialize node: {e}"))
            })?;
            nodes.push(node_from_neo4j(&node)?);
        }
        Ok(nodes)
    }

    /// Rows must expose `r`, `source` and `target`.
    async fn collect_edges(&self, q: neo4rs::Query) -> Result<Vec<GraphEdge>, GraphError> {
        let rows = self.query_rows(q).await?;
        let mut edges = Vec::with_capacity(rows.len());
        for row in rows {
            let rel: neo4rs::Relation = row
                .get("r")
                .map_err(|e| GraphError::Serialization(format!("Failed to get relation: {e}")))?;
            let source: String = row.get("source").unwrap_or_default();
            let target: String = row.get("target").unwrap_or_default();
            edges.push(edge_from_neo4j(&rel, parse_id(&source)?, parse_id(&target)?)?);
        }
        Ok(edges)
    }
}

// ── Conversions ──────────────────────────────────────────────────

fn node_from_neo4j(node: &neo4rs::Node) -> Result<GraphNode, GraphError> {
    let id: String = node.get("id").unwrap_or_default();
    let created_by: String = node.get("created_by").unwrap_or_default();
    Ok(GraphNode {
        id: parse_id(&id)?,
        name: node.get("name").unwrap_or_default(),
        ci_type: node.get("type").unwrap_or_default(),
        attributes: parse_attributes(node.get::<String>("attributes").ok())?,
        tags: node
            .get::<Vec<String>>("tags")
            .unwrap_or_default()
            .into_iter()
            .collect(),
        created_by: parse_id(&created_by)?,
        created_at: parse_time(node.get::<String>("created_at").ok()),
        updated_at: parse_time(node.get::<String>("updated_at").ok()),
    })
}

fn edge_from_neo4j(
    rel: &neo4rs::Relation,
    source: CiId,
    target: CiId,
) -> Result<GraphEdge, GraphError> {
    let id: String = rel.get("id").unwrap_or_default();
    let created_by: String = rel.get("created_by").unwrap_or_default();
    Ok(GraphEdge {
        id: parse_id(&id)?,
        source,
        target,
        relationship_type: rel.get("type").unwrap_or_default(),
        attributes: parse_attributes(rel.get::<String>("attributes").ok())?,
        created_by: parse_id(&created_by)?,
        created_at: parse_time(rel.get::<String>("created_at").ok()),
    })
}

fn parse_id<T>(raw: &str) -> Result<T, GraphError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| GraphError::Serialization(format!("invalid id {raw:?}: {e}")))
}

fn parse_attributes(raw: Option<String>) -> Result<Attributes, GraphError> {
    match raw.as_deref() {
        None | Some("") => Ok(Attributes::new()),
        Some(s) => serde_json::from_str(s)
            .map_err(|e| GraphError::Serialization(format!("invalid attributes: {e}"))),
    }
}

/// Missing or unparseable timestamps fall back to the epoch.
fn parse_time(raw: Option<String>) -> DateTime<Utc> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmdb_core::AttrValue;

    #[test]
    fn attributes_parse_from_stored_json() {
        let attrs = parse_attributes(Some(r#"{"port": 443, "tls": true}"#.into())).unwrap();
        assert_eq!(attrs.get("port"), Some(&AttrValue::Integer(443)));
        assert!(parse_attributes(None).unwrap().is_empty());
        assert!(parse_attributes(Some(String::new())).unwrap().is_empty());
        assert!(parse_attributes(Some("not json".into())).is_err());
    }

    #[test]
    fn timestamps_round_trip_rfc3339() {
        let now = Utc::now();
        assert_eq!(parse_time(Some(now.to_rfc3339())), now);
        assert_eq!(parse_time(Some("garbage".into())), DateTime::<Utc>::default());
    }

    #[test]
    fn ids_reject_garbage() {
        let id = CiId::new();
        assert_eq!(parse_id::<CiId>(&id.to_string()).unwrap(), id);
        assert!(parse_id::<CiId>("nope").is_err());
    }
}
