use chrono::Utc;
use serde_json::json;

use cmdb_audit::{AuditAction, EntityType};
use cmdb_core::types::{CreateRelationshipRequest, RelationshipFilter, UpdateRelationshipRequest};
use cmdb_core::{
    CmdbError, Page, PageRequest, Relationship, RelationshipId, RequestContext, Result,
};

use super::{required_text, Orchestrator};

impl Orchestrator {
    pub async fn create_relationship(
        &self,
        req: CreateRelationshipRequest,
        ctx: &RequestContext,
    ) -> Result<Relationship> {
        self.traced("create_relationship", async {
            required_text("relationship_type", &req.relationship_type)?;
            if req.source_id == req.target_id {
                return Err(CmdbError::InvalidReference(
                    "a CI cannot have a relationship with itself".into(),
                ));
            }
            for (role, id) in [("source", req.source_id), ("target", req.target_id)] {
                if self.store.get_ci(id).await?.is_none() {
                    return Err(CmdbError::InvalidReference(format!(
                        "{role} CI {id} does not exist"
                    )));
                }
            }

            let rel = Relationship {
                id: RelationshipId::new(),
                source_id: req.source_id,
                target_id: req.target_id,
                relationship_type: req.relationship_type.trim().to_string(),
                attributes: req.attributes,
                created_by: ctx.actor,
                created_at: Utc::now(),
                updated_by: None,
                updated_at: None,
            };
            let committed = self.store.insert_relationship(rel).await?;
            self.mirror(&committed).await;
            let rel = committed.value;

            self.record_audit(
                EntityType::Relationship,
                rel.id.0,
                AuditAction::Create,
                ctx,
                json!({
                    "source_id": rel.source_id,
                    "target_id": rel.target_id,
                    "relationship_type": rel.relationship_type,
                }),
            )
            .await;
            tracing::info!(
                relationship_id = %rel.id,
                source_id = %rel.source_id,
                target_id = %rel.target_id,
                relationship_type = %rel.relationship_type,
                "Relationship created"
            );
            Ok(rel)
        })
        .await
    }

    pub async fn get_relationship(&self, id: RelationshipId) -> Result<Relationship> {
        self.store
            .get_relationship(id)
            .await?
            .ok_or_else(|| CmdbError::not_found("Relationship", id))
    }

    pub async fn list_relationships(
        &self,
        filter: &RelationshipFilter,
        page: Option<u32>,
        limit: Option<u32>,
    ) -> Result<Page<Relationship>> {
        let page = PageRequest::from_query(page, limit, cmdb_core::pagination::DEFAULT_PAGE_SIZE);
        self.store.list_relationships(filter, page).await
    }

    /// Endpoints and type are fixed at creation; only attributes change.
    pub async fn update_relationship(
        &self,
        id: RelationshipId,
        req: UpdateRelationshipRequest,
        ctx: &RequestContext,
    ) -> Result<Relationship> {
        self.traced("update_relationship", async {
            let mut rel = self.get_relationship(id).await?;
            if let Some(attributes) = &req.attributes {
                rel.attributes = attributes.clone();
            }
            rel.updated_by = Some(ctx.actor);
            rel.updated_at = Some(Utc::now());

            let committed = self.store.update_relationship(rel).await?;
            self.mirror(&committed).await;
            let rel = committed.value;

            self.record_audit(
                EntityType::Relationship,
                rel.id.0,
                AuditAction::Update,
                ctx,
                json!({ "changes": req }),
            )
            .await;
            tracing::info!(relationship_id = %rel.id, "Relationship updated");
            Ok(rel)
        })
        .await
    }

    pub async fn delete_relationship(&self, id: RelationshipId, ctx: &RequestContext) -> Result<()> {
        self.traced("delete_relationship", async {
            let committed = self
                .store
                .delete_relationship(id)
                .await?
                .ok_or_else(|| CmdbError::not_found("Relationship", id))?;
            self.mirror(&committed).await;

            let rel = committed.value;
            self.record_audit(
                EntityType::Relationship,
                id.0,
                AuditAction::Delete,
                ctx,
                json!({
                    "source_id": rel.source_id,
                    "target_id": rel.target_id,
                    "relationship_type": rel.relationship_type,
                }),
            )
            .await;
            tracing::info!(relationship_id = %id, "Relationship deleted");
            Ok(())
        })
        .await
    }
}
