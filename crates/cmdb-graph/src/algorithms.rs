//! Traversal algorithms shared by every graph index realization.
//!
//! All functions are pure over an [`InMemoryGraph`] snapshot and return
//! results in a deterministic order.

use std::collections::{BTreeMap, HashSet, VecDeque};

use cmdb_core::CiId;

use crate::graph::InMemoryGraph;
use crate::model::{
    CiNetwork, Connectivity, EdgeDirection, GraphData, GraphEdge, GraphFilter, GraphNode,
    ImpactAnalysis, ImpactDirection, ImpactEntry, RelationshipEdge, TypeUsage,
};

// ── Neighbours ───────────────────────────────────────────────────

/// Every edge touching `node`, joined with the CI on the other end, oldest first.
pub fn neighbors(graph: &InMemoryGraph, node: usize) -> Vec<RelationshipEdge> {
    let mut touching: Vec<(usize, usize, EdgeDirection)> = graph.outgoing[node]
        .iter()
        .map(|a| (a.edge, a.peer, EdgeDirection::Outgoing))
        .chain(
            graph.incoming[node]
                .iter()
                .map(|a| (a.edge, a.peer, EdgeDirection::Incoming)),
        )
        .collect();
    touching.sort_by_key(|(edge, _, _)| *edge);

    touching
        .into_iter()
        .map(|(edge, peer, direction)| {
            let e = &graph.edges[edge];
            RelationshipEdge {
                id: e.id,
                relationship_type: e.relationship_type.clone(),
                attributes: e.attributes.clone(),
                created_by: e.created_by,
                created_at: e.created_at,
                direction,
                related_ci: graph.nodes[peer].clone(),
            }
        })
        .collect()
}

// ── Subgraph ─────────────────────────────────────────────────────

/// Nodes matching `filter` in name order up to `filter.limit`, plus the edges among them.
pub fn subgraph(graph: &InMemoryGraph, filter: &GraphFilter) -> GraphData {
    let mut selected: Vec<&GraphNode> = graph.nodes.iter().filter(|n| filter.matches(n)).collect();
    selected.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
    selected.truncate(filter.limit);

    let ids: HashSet<CiId> = selected.iter().map(|n| n.id).collect();
    let edges = dedupe_edges(
        graph
            .edges
            .iter()
            .filter(|e| ids.contains(&e.source) && ids.contains(&e.target))
            .cloned(),
    );

    GraphData {
        nodes: selected.into_iter().cloned().collect(),
        edges,
    }
}

/// Keep the first edge for each `(source, target, type)` triple.
pub fn dedupe_edges(edges: impl IntoIterator<Item = GraphEdge>) -> Vec<GraphEdge> {
    let mut seen = HashSet::new();
    edges
        .into_iter()
        .filter(|e| seen.insert((e.source, e.target, e.relationship_type.clone())))
        .collect()
}

// ── Network ──────────────────────────────────────────────────────

/// All nodes within `depth` hops of `center` ignoring direction, and the edges between them.
///
/// An edge is included when at least one endpoint is strictly closer than
/// `depth`, i.e. it lies on some path of length at most `depth`.
pub fn network(graph: &InMemoryGraph, center: usize, depth: usize) -> CiNetwork {
    let mut dist: Vec<Option<usize>> = vec![None; graph.node_count()];
    dist[center] = Some(0);
    let mut order = vec![center];

    let mut queue = VecDeque::new();
    queue.push_back(center);
    while let Some(node) = queue.pop_front() {
        let d = dist[node].unwrap_or(0);
        if d >= depth {
            continue;
        }
        for peer in graph.undirected_neighbors(node) {
            if dist[peer].is_none() {
                dist[peer] = Some(d + 1);
                order.push(peer);
                queue.push_back(peer);
            }
        }
    }

    let edges = graph
        .edges
        .iter()
        .filter(|e| {
            let (Some(src), Some(tgt)) = (graph.index_of(&e.source), graph.index_of(&e.target))
            else {
                return false;
            };
            match (dist[src], dist[tgt]) {
                (Some(a), Some(b)) => a.min(b) < depth,
                _ => false,
            }
        })
        .cloned()
        .collect();

    CiNetwork {
        center: graph.nodes[center].id,
        nodes: order.into_iter().map(|i| graph.nodes[i].clone()).collect(),
        edges,
    }
}

// ── Cycles ───────────────────────────────────────────────────────

/// Every elementary directed cycle, up to `max_cycles`.
///
/// Johnson's algorithm: for each root, search only the strongly connected
/// component containing it among nodes with a larger index, and keep a node
/// blocked until some path through it closes a cycle. Work is polynomial per
/// reported cycle, so an acyclic graph costs one reachability pass per node.
///
/// Each cycle is rooted at its smallest node index so it is reported
/// exactly once, as `[root, ..., root]`.
pub fn find_cycles(graph: &InMemoryGraph, max_cycles: usize) -> Vec<Vec<CiId>> {
    let n = graph.node_count();
    let succ: Vec<Vec<usize>> = (0..n).map(|i| graph.successors(i)).collect();
    let pred: Vec<Vec<usize>> = (0..n).map(|i| graph.predecessors(i)).collect();
    let mut cycles = Vec::new();
    if max_cycles == 0 {
        return cycles;
    }

    let mut blocked = vec![false; n];
    let mut blocked_by: Vec<Vec<usize>> = vec![Vec::new(); n];

    for root in 0..n {
        let component = component_from(root, &succ, &pred);
        if !succ[root].iter().any(|&w| component[w]) {
            continue;
        }
        for v in (root..n).filter(|&v| component[v]) {
            blocked[v] = false;
            blocked_by[v].clear();
        }

        let mut path = vec![root];
        blocked[root] = true;
        // (node, position of the next successor to try, closed a cycle)
        let mut stack: Vec<(usize, usize, bool)> = vec![(root, 0, false)];

        while let Some(frame) = stack.last_mut() {
            let (node, pos, _) = *frame;
            if let Some(&next) = succ[node].get(pos) {
                frame.1 += 1;
                if !component[next] {
                    continue;
                }
                if next == root {
                    frame.2 = true;
                    let mut cycle: Vec<CiId> = path.iter().map(|&i| graph.nodes[i].id).collect();
                    cycle.push(graph.nodes[root].id);
                    cycles.push(cycle);
                    if cycles.len() >= max_cycles {
                        return cycles;
                    }
                } else if !blocked[next] {
                    blocked[next] = true;
                    path.push(next);
                    stack.push((next, 0, false));
                }
                continue;
            }

            let closed = frame.2;
            stack.pop();
            path.pop();
            if closed {
                unblock(node, &mut blocked, &mut blocked_by);
            } else {
                for &w in succ[node].iter().filter(|&&w| component[w]) {
                    if !blocked_by[w].contains(&node) {
                        blocked_by[w].push(node);
                    }
                }
            }
            if let Some(parent) = stack.last_mut() {
                parent.2 |= closed;
            }
        }
    }

    cycles
}

/// Membership of the strongly connected component of `root` within the
/// nodes indexed `root` or higher.
fn component_from(root: usize, succ: &[Vec<usize>], pred: &[Vec<usize>]) -> Vec<bool> {
    let forward = reach_from(root, succ);
    let backward = reach_from(root, pred);
    forward
        .iter()
        .zip(&backward)
        .map(|(&f, &b)| f && b)
        .collect()
}

fn reach_from(root: usize, adjacency: &[Vec<usize>]) -> Vec<bool> {
    let mut seen = vec![false; adjacency.len()];
    seen[root] = true;
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        for &next in &adjacency[node] {
            if next >= root && !seen[next] {
                seen[next] = true;
                stack.push(next);
            }
        }
    }
    seen
}

fn unblock(node: usize, blocked: &mut [bool], blocked_by: &mut [Vec<usize>]) {
    let mut pending = vec![node];
    while let Some(u) = pending.pop() {
        if !blocked[u] {
            continue;
        }
        blocked[u] = false;
        pending.append(&mut blocked_by[u]);
    }
}

// ── Impact ───────────────────────────────────────────────────────

/// Downstream: CIs with a directed path into `node`. Upstream: CIs reachable from `node`.
pub fn impact_analysis(graph: &InMemoryGraph, node: usize) -> ImpactAnalysis {
    let downstream = bfs_depths(graph, node, |i| graph.predecessors(i));
    let upstream = bfs_depths(graph, node, |i| graph.successors(i));

    ImpactAnalysis {
        ci: graph.nodes[node].id,
        downstream: impact_entries(graph, downstream, ImpactDirection::Downstream),
        upstream: impact_entries(graph, upstream, ImpactDirection::Upstream),
    }
}

/// Shortest hop count from `start` to every reachable node, excluding `start`.
fn bfs_depths<F>(graph: &InMemoryGraph, start: usize, next: F) -> Vec<(usize, usize)>
where
    F: Fn(usize) -> Vec<usize>,
{
    let mut visited = vec![false; graph.node_count()];
    visited[start] = true;
    let mut found = Vec::new();

    let mut queue = VecDeque::new();
    queue.push_back((start, 0usize));
    while let Some((node, depth)) = queue.pop_front() {
        for peer in next(node) {
            if !visited[peer] {
                visited[peer] = true;
                found.push((peer, depth + 1));
                queue.push_back((peer, depth + 1));
            }
        }
    }
    found
}

fn impact_entries(
    graph: &InMemoryGraph,
    reached: Vec<(usize, usize)>,
    direction: ImpactDirection,
) -> Vec<ImpactEntry> {
    let mut entries: Vec<ImpactEntry> = reached
        .into_iter()
        .map(|(i, depth)| {
            let n = &graph.nodes[i];
            ImpactEntry {
                id: n.id,
                name: n.name.clone(),
                ci_type: n.ci_type.clone(),
                depth,
                direction,
            }
        })
        .collect();
    entries.sort_by(|a, b| a.depth.cmp(&b.depth).then(a.id.cmp(&b.id)));
    entries
}

// ── Rankings ─────────────────────────────────────────────────────

/// CIs ranked by distinct adjacent CIs, descending, ties by id. Isolated CIs are omitted.
pub fn most_connected(graph: &InMemoryGraph, limit: usize) -> Vec<Connectivity> {
    let mut ranked: Vec<Connectivity> = (0..graph.node_count())
        .filter_map(|i| {
            let count = graph.undirected_neighbors(i).len();
            (count > 0).then(|| {
                let n = &graph.nodes[i];
                Connectivity {
                    id: n.id,
                    name: n.name.clone(),
                    ci_type: n.ci_type.clone(),
                    connection_count: count,
                }
            })
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.connection_count
            .cmp(&a.connection_count)
            .then(a.id.cmp(&b.id))
    });
    ranked.truncate(limit);
    ranked
}

/// CI count per type, descending by count, ties by type name.
pub fn type_usage<'a>(nodes: impl IntoIterator<Item = &'a GraphNode>) -> Vec<TypeUsage> {
    let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
    for n in nodes {
        *counts.entry(n.ci_type.as_str()).or_default() += 1;
    }
    let mut usage: Vec<TypeUsage> = counts
        .into_iter()
        .map(|(ci_type, count)| TypeUsage {
            ci_type: ci_type.to_string(),
            count,
        })
        .collect();
    usage.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.ci_type.cmp(&b.ci_type)));
    usage
}
