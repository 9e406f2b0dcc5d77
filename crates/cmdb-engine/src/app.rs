//! Wiring: build every store from [`CmdbConfig`] and hand them to the orchestrator.

use std::sync::Arc;

use tokio::task::JoinHandle;

use cmdb_audit::AuditService;
use cmdb_core::config::{CacheBackend, CmdbConfig, GraphBackend};
use cmdb_core::Result;
use cmdb_graph::{GraphClient, GraphConfig, GraphIndex, MemoryGraphIndex};

use crate::cache::{Cache, MemoryCache, RedisCache};
use crate::mirror::MirrorWorker;
use crate::orchestrator::{Orchestrator, OrchestratorOptions};
use crate::store::{PrimaryStore, SqliteStore};

pub struct Engine {
    pub orchestrator: Arc<Orchestrator>,
    /// Present when the graph index is Neo4j.
    pub neo4j: Option<GraphClient>,
    config: CmdbConfig,
    /// Expiry sweep for the in-process cache.
    janitor: Option<JoinHandle<()>>,
}

impl Engine {
    pub async fn build(config: CmdbConfig) -> Result<Self> {
        let store: Arc<dyn PrimaryStore> = Arc::new(SqliteStore::connect(&config.store).await?);

        let (graph, neo4j): (Arc<dyn GraphIndex>, Option<GraphClient>) = match config.graph.backend {
            GraphBackend::Memory => (Arc::new(MemoryGraphIndex::new()), None),
            GraphBackend::Neo4j => {
                let client = GraphClient::connect(&GraphConfig::from(&config.neo4j)).await?;
                (Arc::new(client.clone()), Some(client))
            }
        };

        let mut janitor = None;
        let cache: Arc<dyn Cache> = match config.cache.backend {
            CacheBackend::Memory => {
                let cache = Arc::new(MemoryCache::new());
                let every = config.cache.purge_interval();
                if !every.is_zero() {
                    janitor = Some(cache.spawn_janitor(every));
                }
                cache
            }
            CacheBackend::Redis => Arc::new(RedisCache::connect(&config.redis, &config.cache).await?),
        };

        let audit = Arc::new(AuditService::from_config(&config.audit)?);

        let span = tracing::info_span!("engine", environment = %config.environment);
        let orchestrator = Orchestrator::new(store, graph, cache, audit, span)
            .with_options(OrchestratorOptions::from(&config));

        let engine = Self {
            orchestrator: Arc::new(orchestrator),
            neo4j,
            config,
            janitor,
        };

        // An in-process graph starts empty and has to be derived again.
        if engine.config.graph.backend == GraphBackend::Memory {
            engine.orchestrator.reconcile().await?;
        }
        Ok(engine)
    }

    pub fn config(&self) -> &CmdbConfig {
        &self.config
    }

    pub fn mirror_worker(&self) -> MirrorWorker {
        MirrorWorker::new(
            self.orchestrator.store().clone(),
            self.orchestrator.graph().clone(),
            self.config.mirror.clone(),
        )
        .with_gate(self.orchestrator.gate().clone())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(janitor) = self.janitor.take() {
            janitor.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::tests::{ci, ci_type};

    #[tokio::test]
    async fn restart_rederives_memory_graph_from_database() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CmdbConfig::default();
        config.store.database_url = format!("sqlite://{}", dir.path().join("store.db").display());

        let first = Engine::build(config.clone()).await.unwrap();
        let store = first.orchestrator.store();
        store.insert_ci_type(ci_type("Server")).await.unwrap();
        let web = store.insert_ci(ci("web-1", "Server")).await.unwrap().value;
        drop(first);

        let second = Engine::build(config).await.unwrap();
        let network = second.orchestrator.ci_network(web.id, 1).await.unwrap();
        assert_eq!(network.center, web.id);
        assert_eq!(second.orchestrator.store().outbox_len().await.unwrap(), 0);
        assert!(second.neo4j.is_none());
    }

    #[tokio::test]
    async fn memory_cache_gets_a_janitor_unless_disabled() {
        let mut config = CmdbConfig::default();
        config.store.database_url = "sqlite::memory:".into();
        let engine = Engine::build(config.clone()).await.unwrap();
        assert!(engine.janitor.is_some());

        config.cache.purge_interval_secs = 0;
        let engine = Engine::build(config).await.unwrap();
        assert!(engine.janitor.is_none());
    }
}
