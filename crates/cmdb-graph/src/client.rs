//! Neo4j connection management and the graph index realization on top of it.

use async_trait::async_trait;
use neo4rs::{ConfigBuilder, Graph, Query};

use cmdb_core::{CiId, CmdbError, RelationshipId};

use crate::algorithms;
use crate::index::GraphIndex;
use crate::model::{
    CiNetwork, Connectivity, GraphData, GraphEdge, GraphFilter, GraphNode, ImpactAnalysis,
    RelationshipEdge, TypeUsage, MAX_CYCLES,
};

/// Errors from graph operations.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Neo4j connection error: {0}")]
    Connection(String),

    #[error("Neo4j query error: {0}")]
    Query(#[from] neo4rs::Error),

    #[error("{entity} not found in graph index: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl GraphError {
    pub fn ci_not_found(id: CiId) -> Self {
        Self::NotFound {
            entity: "configuration item",
            id: id.to_string(),
        }
    }
}

impl From<GraphError> for CmdbError {
    fn from(e: GraphError) -> Self {
        match e {
            GraphError::NotFound { entity, id } => CmdbError::NotFound { entity, id },
            other => CmdbError::Internal(other.to_string()),
        }
    }
}

/// Configuration for connecting to Neo4j.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
    /// Target database; the server default when `None`.
    pub database: Option<String>,
    pub max_connections: u32,
    pub fetch_size: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            uri: "bolt://localhost:7687".to_string(),
            user: "neo4j".to_string(),
            password: "cmdb-dev".to_string(),
            database: None,
            max_connections: 16,
            fetch_size: 256,
        }
    }
}

impl From<&cmdb_core::config::Neo4jSettings> for GraphConfig {
    fn from(s: &cmdb_core::config::Neo4jSettings) -> Self {
        Self {
            uri: s.uri.clone(),
            user: s.user.clone(),
            password: s.password.clone(),
            database: s.database.clone(),
            max_connections: s.max_connections,
            fetch_size: s.fetch_size,
        }
    }
}

/// Thread-safe Neo4j graph client with connection pooling.
///
/// Sessions are taken from the pool per query and returned when the query
/// finishes. Clone is cheap (inner Arc).
#[derive(Clone)]
pub struct GraphClient {
    graph: Graph,
}

impl GraphClient {
    /// Connect to Neo4j with the given configuration.
    pub async fn connect(config: &GraphConfig) -> Result<Self, GraphError> {
        let mut builder = ConfigBuilder::default()
            .uri(&config.uri)
            .user(&config.user)
            .password(&config.password)
            .max_connections(config.max_connections as usize)
            .fetch_size(config.fetch_size);
        if let Some(db) = &config.database {
            builder = builder.db(db.as_str());
        }
        let neo_config = builder
            .build()
            .map_err(|e| GraphError::Connection(e.to_string()))?;

        let graph = Graph::connect(neo_config)
            .await
            .map_err(|e| GraphError::Connection(e.to_string()))?;

        tracing::info!(uri = %config.uri, "Connected to Neo4j");
        Ok(Self { graph })
    }

    /// Execute a write-only query (CREATE, MERGE, DELETE, SET).
    pub async fn run(&self, query: Query) -> Result<(), GraphError> {
        self.graph.run(query).await?;
        Ok(())
    }

    /// Execute a read query and collect all rows.
    pub async fn query_rows(&self, query: Query) -> Result<Vec<neo4rs::Row>, GraphError> {
        let mut stream = self.graph.execute(query).await?;
        let mut rows = Vec::new();
        while let Some(row) = stream.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Execute a read query and return the first row, if any.
    pub async fn query_one(&self, query: Query) -> Result<Option<neo4rs::Row>, GraphError> {
        let mut stream = self.graph.execute(query).await?;
        Ok(stream.next().await?)
    }

    /// Begin a transaction.
    pub async fn start_txn(&self) -> Result<neo4rs::Txn, GraphError> {
        Ok(self.graph.start_txn().await?)
    }

    /// Create the indexes and uniqueness constraints the mirror relies on.
    pub async fn init_schema(&self) -> Result<(), GraphError> {
        const STATEMENTS: &[&str] = &[
            "CREATE INDEX configuration_item_id_index IF NOT EXISTS FOR (ci:ConfigurationItem) ON (ci.id)",
            "CREATE INDEX configuration_item_name_index IF NOT EXISTS FOR (ci:ConfigurationItem) ON (ci.name)",
            "CREATE INDEX configuration_item_type_index IF NOT EXISTS FOR (ci:ConfigurationItem) ON (ci.type)",
            "CREATE INDEX relationship_id_index IF NOT EXISTS FOR ()-[r:RELATES_TO]-() ON (r.id)",
            "CREATE INDEX relationship_type_index IF NOT EXISTS FOR ()-[r:RELATES_TO]-() ON (r.type)",
            "CREATE CONSTRAINT configuration_item_id_unique IF NOT EXISTS FOR (ci:ConfigurationItem) REQUIRE ci.id IS UNIQUE",
            "CREATE CONSTRAINT relationship_id_unique IF NOT EXISTS FOR ()-[r:RELATES_TO]-() REQUIRE r.id IS UNIQUE",
        ];

        for stmt in STATEMENTS {
            self.run(neo4rs::query(stmt)).await?;
        }
        tracing::info!(statements = STATEMENTS.len(), "Graph schema initialized");
        Ok(())
    }

    async fn snapshot_graph(&self) -> Result<crate::InMemoryGraph, GraphError> {
        let data = self.fetch_snapshot().await?;
        Ok(crate::InMemoryGraph::from_snapshot(data.nodes, data.edges))
    }
}

// ── GraphIndex ───────────────────────────────────────────────────

#[async_trait]
impl GraphIndex for GraphClient {
    async fn upsert_node(&self, node: &GraphNode) -> Result<(), GraphError> {
        self.merge_ci_node(node).await
    }

    async fn delete_node(&self, id: CiId) -> Result<(), GraphError> {
        self.detach_delete_ci(id).await
    }

    async fn upsert_edge(&self, edge: &GraphEdge) -> Result<(), GraphError> {
        self.merge_relationship_edge(edge).await
    }

    async fn delete_edge(&self, id: RelationshipId) -> Result<(), GraphError> {
        self.delete_relationship_edge(id).await
    }

    async fn rebuild(&self, nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) -> Result<(), GraphError> {
        self.replace_all(&nodes, &edges).await
    }

    async fn relationship_count(&self, id: CiId) -> Result<usize, GraphError> {
        self.count_ci_relationships(id).await
    }

    async fn neighbors(&self, id: CiId) -> Result<Vec<RelationshipEdge>, GraphError> {
        if !self.ci_exists(id).await? {
            return Err(GraphError::ci_not_found(id));
        }
        self.ci_relationships(id).await
    }

    async fn subgraph(&self, filter: &GraphFilter) -> Result<GraphData, GraphError> {
        self.graph_data(filter).await
    }

    async fn network(&self, id: CiId, depth: usize) -> Result<CiNetwork, GraphError> {
        let graph = self.snapshot_graph().await?;
        let center = graph.index_of(&id).ok_or_else(|| GraphError::ci_not_found(id))?;
        Ok(algorithms::network(&graph, center, depth))
    }

    async fn find_cycles(&self) -> Result<Vec<Vec<CiId>>, GraphError> {
        let graph = self.snapshot_graph().await?;
        Ok(algorithms::find_cycles(&graph, MAX_CYCLES))
    }

    async fn impact_analysis(&self, id: CiId) -> Result<ImpactAnalysis, GraphError> {
        let graph = self.snapshot_graph().await?;
        let node = graph.index_of(&id).ok_or_else(|| GraphError::ci_not_found(id))?;
        Ok(algorithms::impact_analysis(&graph, node))
    }

    async fn most_connected(&self, limit: usize) -> Result<Vec<Connectivity>, GraphError> {
        self.connectivity_ranking(limit).await
    }

    async fn type_usage(&self) -> Result<Vec<TypeUsage>, GraphError> {
        self.ci_type_usage().await
    }
}
