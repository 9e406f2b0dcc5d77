use chrono::Utc;
use serde_json::json;

use cmdb_audit::{AuditAction, EntityType};
use cmdb_core::types::{normalize_tags, CiFilter, CreateCiRequest, UpdateCiRequest};
use cmdb_core::{CiId, CmdbError, ConfigurationItem, Page, PageRequest, RequestContext, Result};

use super::{required_text, Orchestrator};
use crate::cache::ci_key;
use crate::store::DeleteOutcome;

impl Orchestrator {
    pub async fn create_ci(
        &self,
        req: CreateCiRequest,
        ctx: &RequestContext,
    ) -> Result<ConfigurationItem> {
        self.traced("create_ci", async {
            required_text("name", &req.name)?;
            let schema = self.get_ci_type_by_name(req.ci_type.trim()).await?;

            let now = Utc::now();
            let ci = ConfigurationItem {
                id: CiId::new(),
                name: req.name.trim().to_string(),
                ci_type: schema.name,
                attributes: req.attributes,
                tags: normalize_tags(&req.tags),
                created_by: ctx.actor,
                created_at: now,
                updated_by: None,
                updated_at: now,
            };
            let committed = self.store.insert_ci(ci).await?;
            self.mirror(&committed).await;
            let ci = committed.value;
            self.invalidate_ci(ci.id).await;

            self.record_audit(
                EntityType::Ci,
                ci.id.0,
                AuditAction::Create,
                ctx,
                json!({ "ci_name": ci.name, "ci_type": ci.ci_type }),
            )
            .await;
            tracing::info!(ci_id = %ci.id, name = %ci.name, ci_type = %ci.ci_type, "CI created");
            Ok(ci)
        })
        .await
    }

    /// Read-through: a cache failure or undecodable entry falls back to the store.
    pub async fn get_ci(&self, id: CiId) -> Result<ConfigurationItem> {
        self.traced("get_ci", async {
            let key = ci_key(id);
            match self.bounded(self.cache.get(&key)).await {
                Ok(Some(bytes)) => match serde_json::from_slice::<ConfigurationItem>(&bytes) {
                    Ok(ci) => return Ok(ci),
                    Err(e) => {
                        tracing::warn!(ci_id = %id, error = %e, "Discarding undecodable cache entry");
                        if let Err(e) = self.bounded(self.cache.delete(&key)).await {
                            tracing::warn!(ci_id = %id, error = %e, "Cache delete failed");
                        }
                    }
                },
                Ok(None) => {}
                Err(e) => tracing::warn!(ci_id = %id, error = %e, "Cache read failed"),
            }

            let ci = self
                .store
                .get_ci(id)
                .await?
                .ok_or_else(|| CmdbError::not_found("CI", id))?;

            let payload = serde_json::to_vec(&ci)?;
            if let Err(e) = self
                .bounded(self.cache.set(&key, &payload, self.options.cache_ttl))
                .await
            {
                tracing::warn!(ci_id = %id, error = %e, "Cache fill failed");
            }
            Ok(ci)
        })
        .await
    }

    pub async fn list_cis(
        &self,
        filter: &CiFilter,
        page: Option<u32>,
        limit: Option<u32>,
    ) -> Result<Page<ConfigurationItem>> {
        let page = PageRequest::from_query(page, limit, cmdb_core::pagination::DEFAULT_PAGE_SIZE);
        self.store.list_cis(filter, page).await
    }

    pub async fn update_ci(
        &self,
        id: CiId,
        req: UpdateCiRequest,
        ctx: &RequestContext,
    ) -> Result<ConfigurationItem> {
        self.traced("update_ci", async {
            let mut ci = self
                .store
                .get_ci(id)
                .await?
                .ok_or_else(|| CmdbError::not_found("CI", id))?;

            if let Some(attributes) = &req.attributes {
                ci.attributes = attributes.clone();
            }
            if let Some(tags) = &req.tags {
                ci.tags = normalize_tags(tags);
            }
            ci.updated_by = Some(ctx.actor);
            ci.updated_at = Utc::now();

            let committed = self.store.update_ci(ci).await?;
            self.mirror(&committed).await;
            let ci = committed.value;
            self.invalidate_ci(ci.id).await;

            self.record_audit(
                EntityType::Ci,
                ci.id.0,
                AuditAction::Update,
                ctx,
                json!({ "ci_name": ci.name, "ci_type": ci.ci_type, "changes": req }),
            )
            .await;
            tracing::info!(ci_id = %ci.id, name = %ci.name, "CI updated");
            Ok(ci)
        })
        .await
    }

    /// Refused with `Conflict` while any relationship touches the CI.
    pub async fn delete_ci(&self, id: CiId, ctx: &RequestContext) -> Result<()> {
        self.traced("delete_ci", async {
            if self.store.get_ci(id).await?.is_none() {
                return Err(CmdbError::not_found("CI", id));
            }

            // The graph answers fast; the store re-checks under its lock either way.
            match self.bounded(self.graph.relationship_count(id)).await {
                Ok(0) => {}
                Ok(n) => return Err(referenced(n as u64)),
                Err(e) => tracing::warn!(
                    ci_id = %id,
                    error = %e,
                    "Graph relationship count unavailable; relying on primary store"
                ),
            }

            let committed = match self.store.delete_ci_if_unreferenced(id).await? {
                DeleteOutcome::Deleted(committed) => committed,
                DeleteOutcome::Referenced(n) => return Err(referenced(n)),
                DeleteOutcome::Missing => return Err(CmdbError::not_found("CI", id)),
            };
            self.mirror(&committed).await;
            self.invalidate_ci(id).await;

            let ci = committed.value;
            self.record_audit(
                EntityType::Ci,
                id.0,
                AuditAction::Delete,
                ctx,
                json!({ "ci_name": ci.name, "ci_type": ci.ci_type }),
            )
            .await;
            tracing::info!(ci_id = %id, name = %ci.name, "CI deleted");
            Ok(())
        })
        .await
    }
}

fn referenced(count: u64) -> CmdbError {
    CmdbError::Conflict(format!(
        "cannot delete CI with existing relationships ({count} remaining)"
    ))
}

#[cfg(test)]
mod tests {
    use super::super::tests::harness;
    use super::*;
    use crate::cache::Cache;
    use crate::store::memory::tests::{ci_type, relationship};
    use crate::store::PrimaryStore;
    use cmdb_core::{AttrValue, Attributes};
    use cmdb_graph::GraphIndex;
    use std::time::Duration;

    fn hostname(value: &str) -> Attributes {
        Attributes::from([("hostname".to_string(), AttrValue::from(value))])
    }

    fn request(name: &str) -> CreateCiRequest {
        CreateCiRequest {
            name: name.into(),
            ci_type: "Server".into(),
            attributes: hostname(name),
            tags: vec!["prod".into(), " prod ".into(), "web".into()],
        }
    }

    #[tokio::test]
    async fn create_mirrors_and_normalizes_tags() {
        let h = harness();
        h.store.insert_ci_type(ci_type("Server")).await.unwrap();

        let ci = h.orchestrator.create_ci(request("web-1"), &h.ctx).await.unwrap();
        assert_eq!(ci.tags.iter().collect::<Vec<_>>(), vec!["prod", "web"]);
        assert_eq!(ci.created_by, h.ctx.actor);
        assert!(h.graph.contains_node(ci.id).await);
        assert_eq!(h.store.outbox_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn create_requires_known_type_and_valid_attributes() {
        let h = harness();
        let err = h
            .orchestrator
            .create_ci(request("web-1"), &h.ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, CmdbError::NotFound { entity: "CI type", .. }));

        h.store.insert_ci_type(ci_type("Server")).await.unwrap();
        let mut missing = request("web-1");
        missing.attributes.clear();
        let err = h.orchestrator.create_ci(missing, &h.ctx).await.unwrap_err();
        assert_eq!(err.validation_errors().len(), 1);
        assert_eq!(err.validation_errors()[0].field, "hostname");
        assert_eq!(h.store.count_cis().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn get_fills_cache_and_update_invalidates() {
        let h = harness();
        h.store.insert_ci_type(ci_type("Server")).await.unwrap();
        let ci = h.orchestrator.create_ci(request("web-1"), &h.ctx).await.unwrap();

        h.orchestrator.get_ci(ci.id).await.unwrap();
        assert!(h.cache.get(&ci_key(ci.id)).await.unwrap().is_some());

        let patch = UpdateCiRequest {
            attributes: Some(hostname("web-1.internal")),
            tags: None,
        };
        let updated = h.orchestrator.update_ci(ci.id, patch, &h.ctx).await.unwrap();
        assert_eq!(updated.updated_by, Some(h.ctx.actor));
        assert_eq!(updated.tags, ci.tags);
        assert!(h.cache.get(&ci_key(ci.id)).await.unwrap().is_none());

        let fetched = h.orchestrator.get_ci(ci.id).await.unwrap();
        assert_eq!(
            fetched.attributes.get("hostname").and_then(AttrValue::as_str),
            Some("web-1.internal")
        );
    }

    #[tokio::test]
    async fn corrupt_cache_entry_is_replaced() {
        let h = harness();
        h.store.insert_ci_type(ci_type("Server")).await.unwrap();
        let ci = h.orchestrator.create_ci(request("web-1"), &h.ctx).await.unwrap();
        h.cache
            .set(&ci_key(ci.id), b"{not json", Duration::from_secs(60))
            .await
            .unwrap();

        let fetched = h.orchestrator.get_ci(ci.id).await.unwrap();
        assert_eq!(fetched.id, ci.id);
        let cached = h.cache.get(&ci_key(ci.id)).await.unwrap().unwrap();
        let decoded: ConfigurationItem = serde_json::from_slice(&cached).unwrap();
        assert_eq!(decoded.id, ci.id);
    }

    #[tokio::test]
    async fn delete_refused_while_store_still_references_ci() {
        let h = harness();
        h.store.insert_ci_type(ci_type("Server")).await.unwrap();
        let a = h.orchestrator.create_ci(request("web-1"), &h.ctx).await.unwrap();
        let b = h.orchestrator.create_ci(request("db-1"), &h.ctx).await.unwrap();
        // Written behind the orchestrator's back: the graph never sees it.
        h.store
            .insert_relationship(relationship(a.id, b.id, "depends_on"))
            .await
            .unwrap();
        assert_eq!(h.graph.relationship_count(a.id).await.unwrap(), 0);

        let err = h.orchestrator.delete_ci(a.id, &h.ctx).await.unwrap_err();
        assert!(matches!(err, CmdbError::Conflict(_)));
        assert!(h.store.get_ci(a.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_removes_from_every_store() {
        let h = harness();
        h.store.insert_ci_type(ci_type("Server")).await.unwrap();
        let ci = h.orchestrator.create_ci(request("web-1"), &h.ctx).await.unwrap();
        h.orchestrator.get_ci(ci.id).await.unwrap();

        h.orchestrator.delete_ci(ci.id, &h.ctx).await.unwrap();
        assert!(!h.graph.contains_node(ci.id).await);
        assert!(h.cache.get(&ci_key(ci.id)).await.unwrap().is_none());
        assert!(matches!(
            h.orchestrator.get_ci(ci.id).await,
            Err(CmdbError::NotFound { entity: "CI", .. })
        ));
        assert!(matches!(
            h.orchestrator.delete_ci(ci.id, &h.ctx).await,
            Err(CmdbError::NotFound { .. })
        ));
    }
}
