//! Read-only graph queries, answered from the Graph Index.
//!
//! Results may trail the Primary Store by whatever the mirror has not yet
//! applied.

use cmdb_core::{CiId, Result};
use cmdb_graph::{CiNetwork, Connectivity, GraphData, GraphFilter, ImpactAnalysis, RelationshipEdge, TypeUsage};

use super::{Orchestrator, MAX_GRAPH_LIMIT, MAX_NETWORK_DEPTH};

impl Orchestrator {
    pub async fn graph_data(&self, mut filter: GraphFilter) -> Result<GraphData> {
        filter.limit = filter.limit.clamp(1, MAX_GRAPH_LIMIT);
        self.traced("graph_data", async { Ok(self.graph.subgraph(&filter).await?) })
            .await
    }

    pub async fn ci_network(&self, id: CiId, depth: usize) -> Result<CiNetwork> {
        let depth = depth.clamp(1, MAX_NETWORK_DEPTH);
        self.traced("ci_network", async { Ok(self.graph.network(id, depth).await?) })
            .await
    }

    pub async fn ci_relationships(&self, id: CiId) -> Result<Vec<RelationshipEdge>> {
        self.traced("ci_relationships", async { Ok(self.graph.neighbors(id).await?) })
            .await
    }

    pub async fn find_cycles(&self) -> Result<Vec<Vec<CiId>>> {
        self.traced("find_cycles", async { Ok(self.graph.find_cycles().await?) })
            .await
    }

    pub async fn impact_analysis(&self, id: CiId) -> Result<ImpactAnalysis> {
        self.traced("impact_analysis", async {
            Ok(self.graph.impact_analysis(id).await?)
        })
        .await
    }

    pub async fn most_connected(&self, limit: usize) -> Result<Vec<Connectivity>> {
        let limit = limit.clamp(1, MAX_GRAPH_LIMIT);
        self.traced("most_connected", async {
            Ok(self.graph.most_connected(limit).await?)
        })
        .await
    }

    pub async fn type_usage(&self) -> Result<Vec<TypeUsage>> {
        self.traced("type_usage", async { Ok(self.graph.type_usage().await?) })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::harness;
    use super::*;
    use crate::store::memory::tests::{ci, ci_type, relationship};
    use crate::store::PrimaryStore;
    use cmdb_core::CmdbError;

    #[tokio::test]
    async fn queries_see_mirrored_writes() {
        let h = harness();
        h.store.insert_ci_type(ci_type("Server")).await.unwrap();
        let mut ids = Vec::new();
        for name in ["a", "b", "c"] {
            let committed = h.store.insert_ci(ci(name, "Server")).await.unwrap();
            h.orchestrator.mirror(&committed).await;
            ids.push(committed.value.id);
        }
        for (s, t) in [(0, 1), (1, 2), (2, 0)] {
            let committed = h
                .store
                .insert_relationship(relationship(ids[s], ids[t], "depends_on"))
                .await
                .unwrap();
            h.orchestrator.mirror(&committed).await;
        }

        let cycles = h.orchestrator.find_cycles().await.unwrap();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].len(), 4);

        let filter = GraphFilter {
            limit: 0,
            ..Default::default()
        };
        assert_eq!(h.orchestrator.graph_data(filter).await.unwrap().nodes.len(), 1);

        let network = h.orchestrator.ci_network(ids[0], 0).await.unwrap();
        assert_eq!(network.nodes.len(), 3);

        assert_eq!(h.orchestrator.ci_relationships(ids[1]).await.unwrap().len(), 2);
        let usage = h.orchestrator.type_usage().await.unwrap();
        assert_eq!(usage[0].count, 3);
        assert_eq!(h.orchestrator.most_connected(0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_ci_is_not_found() {
        let h = harness();
        assert!(matches!(
            h.orchestrator.impact_analysis(CiId::new()).await,
            Err(CmdbError::NotFound { .. })
        ));
    }
}
