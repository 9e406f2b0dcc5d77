//! In-memory graph representation for traversal algorithms.
//!
//! Converts mirrored `GraphNode` and `GraphEdge` records into a compact
//! adjacency list with dense node indices. Nodes are ordered by id so that
//! every traversal over the same snapshot is deterministic.

use std::collections::HashMap;

use cmdb_core::CiId;

use crate::model::{GraphEdge, GraphNode};

/// One entry of an adjacency list.
#[derive(Debug, Clone, Copy)]
pub struct Adjacent {
    /// Index into `InMemoryGraph::edges`.
    pub edge: usize,
    /// Dense index of the node on the other end.
    pub peer: usize,
}

/// The in-memory graph for traversal algorithms.
pub struct InMemoryGraph {
    /// All nodes, indexed by dense index.
    pub nodes: Vec<GraphNode>,
    /// Edges whose endpoints are both present.
    pub edges: Vec<GraphEdge>,
    /// `outgoing[i]` = edges with node `i` as source.
    pub outgoing: Vec<Vec<Adjacent>>,
    /// `incoming[i]` = edges with node `i` as target.
    pub incoming: Vec<Vec<Adjacent>>,
    /// Map from CI id to dense index.
    pub node_index: HashMap<CiId, usize>,
}

impl InMemoryGraph {
    /// Build from a mirrored snapshot. Edges with a missing endpoint are dropped.
    pub fn from_snapshot(mut nodes: Vec<GraphNode>, mut edges: Vec<GraphEdge>) -> Self {
        nodes.sort_by_key(|n| n.id);
        nodes.dedup_by_key(|n| n.id);
        edges.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let node_index: HashMap<CiId, usize> =
            nodes.iter().enumerate().map(|(i, n)| (n.id, i)).collect();

        let mut outgoing = vec![Vec::new(); nodes.len()];
        let mut incoming = vec![Vec::new(); nodes.len()];
        let mut kept = Vec::with_capacity(edges.len());

        for edge in edges {
            if let (Some(&src), Some(&tgt)) =
                (node_index.get(&edge.source), node_index.get(&edge.target))
            {
                let pos = kept.len();
                outgoing[src].push(Adjacent { edge: pos, peer: tgt });
                incoming[tgt].push(Adjacent { edge: pos, peer: src });
                kept.push(edge);
            }
        }

        Self {
            nodes,
            edges: kept,
            outgoing,
            incoming,
            node_index,
        }
    }

    pub fn index_of(&self, id: &CiId) -> Option<usize> {
        self.node_index.get(id).copied()
    }

    /// Distinct direct successors of `node`, in index order.
    pub fn successors(&self, node: usize) -> Vec<usize> {
        let mut out: Vec<usize> = self.outgoing[node].iter().map(|a| a.peer).collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Distinct direct predecessors of `node`, in index order.
    pub fn predecessors(&self, node: usize) -> Vec<usize> {
        let mut out: Vec<usize> = self.incoming[node].iter().map(|a| a.peer).collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Distinct adjacent nodes ignoring direction, excluding `node` itself.
    pub fn undirected_neighbors(&self, node: usize) -> Vec<usize> {
        let mut out: Vec<usize> = self.outgoing[node]
            .iter()
            .chain(self.incoming[node].iter())
            .map(|a| a.peer)
            .filter(|&p| p != node)
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of edges in the graph.
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}
