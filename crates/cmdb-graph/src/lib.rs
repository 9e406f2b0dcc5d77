//! CMDB Graph: the derived, eventually consistent graph index.
//!
//! The Primary Store owns every identity; this crate only mirrors CIs as
//! nodes and relationships as directed edges so traversal queries (cycles,
//! reachability, connectivity ranking) can be answered. Two realizations
//! share the [`GraphIndex`] contract: an embedded [`MemoryGraphIndex`] and
//! a Neo4j-backed [`GraphClient`].

pub mod algorithms;
pub mod client;
pub mod graph;
pub mod index;
pub mod memory;
pub mod model;
pub mod mutations;
pub mod queries;

pub use client::{GraphClient, GraphConfig, GraphError};
pub use graph::InMemoryGraph;
pub use index::GraphIndex;
pub use memory::MemoryGraphIndex;
pub use model::{
    CiNetwork, Connectivity, EdgeDirection, GraphData, GraphEdge, GraphFilter, GraphNode,
    ImpactAnalysis, ImpactDirection, ImpactEntry, RelationshipEdge, TypeUsage,
};

pub type Result<T> = std::result::Result<T, GraphError>;
