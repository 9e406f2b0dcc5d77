//! Records exchanged with the graph index.
//!
//! Nodes and edges are denormalized copies of Primary Store rows, keyed by
//! the same identifiers.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cmdb_core::{Attributes, CiId, ConfigurationItem, Relationship, RelationshipId, UserId};

/// Default number of nodes returned by a subgraph query.
pub const DEFAULT_SUBGRAPH_LIMIT: usize = 100;

/// Upper bound on cycles reported by a single `find_cycles` call.
pub const MAX_CYCLES: usize = 50;

/// A CI as mirrored into the graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphNode {
    pub id: CiId,
    pub name: String,
    #[serde(rename = "type")]
    pub ci_type: String,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&ConfigurationItem> for GraphNode {
    fn from(ci: &ConfigurationItem) -> Self {
        Self {
            id: ci.id,
            name: ci.name.clone(),
            ci_type: ci.ci_type.clone(),
            attributes: ci.attributes.clone(),
            tags: ci.tags.clone(),
            created_by: ci.created_by,
            created_at: ci.created_at,
            updated_at: ci.updated_at,
        }
    }
}

/// A relationship as mirrored into the graph. Always directed `source -> target`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphEdge {
    pub id: RelationshipId,
    pub source: CiId,
    pub target: CiId,
    pub relationship_type: String,
    #[serde(default)]
    pub attributes: Attributes,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

impl From<&Relationship> for GraphEdge {
    fn from(rel: &Relationship) -> Self {
        Self {
            id: rel.id,
            source: rel.source_id,
            target: rel.target_id,
            relationship_type: rel.relationship_type.clone(),
            attributes: rel.attributes.clone(),
            created_by: rel.created_by,
            created_at: rel.created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EdgeDirection {
    /// The queried CI is the source.
    Outgoing,
    /// The queried CI is the target.
    Incoming,
}

/// One relationship touching a CI, joined with the CI on the other end.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelationshipEdge {
    pub id: RelationshipId,
    pub relationship_type: String,
    #[serde(default)]
    pub attributes: Attributes,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub direction: EdgeDirection,
    pub related_ci: GraphNode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GraphData {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphFilter {
    /// Restrict to these CI types. Empty means every type.
    #[serde(default)]
    pub ci_types: Vec<String>,
    /// Case-insensitive substring on the CI name.
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_SUBGRAPH_LIMIT
}

impl Default for GraphFilter {
    fn default() -> Self {
        Self {
            ci_types: Vec::new(),
            search: None,
            limit: DEFAULT_SUBGRAPH_LIMIT,
        }
    }
}

impl GraphFilter {
    pub fn matches(&self, node: &GraphNode) -> bool {
        if !self.ci_types.is_empty() && !self.ci_types.iter().any(|t| *t == node.ci_type) {
            return false;
        }
        match self.search.as_deref().map(str::trim) {
            Some(term) if !term.is_empty() => node
                .name
                .to_lowercase()
                .contains(&term.to_lowercase()),
            _ => true,
        }
    }
}

/// Neighbourhood of a CI within a hop bound, ignoring edge direction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CiNetwork {
    pub center: CiId,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImpactDirection {
    /// Depends on the analysed CI.
    Downstream,
    /// The analysed CI depends on it.
    Upstream,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImpactEntry {
    pub id: CiId,
    pub name: String,
    #[serde(rename = "type")]
    pub ci_type: String,
    pub depth: usize,
    pub direction: ImpactDirection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImpactAnalysis {
    pub ci: CiId,
    pub downstream: Vec<ImpactEntry>,
    pub upstream: Vec<ImpactEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Connectivity {
    pub id: CiId,
    pub name: String,
    #[serde(rename = "type")]
    pub ci_type: String,
    pub connection_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypeUsage {
    #[serde(rename = "type")]
    pub ci_type: String,
    pub count: u64,
}
