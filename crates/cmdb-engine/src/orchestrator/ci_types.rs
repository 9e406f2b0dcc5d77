use chrono::Utc;
use serde_json::json;

use cmdb_audit::{AuditAction, EntityType};
use cmdb_core::types::{CreateCiTypeRequest, UpdateCiTypeRequest};
use cmdb_core::validate::validate_schema;
use cmdb_core::{
    CiTypeDefinition, CiTypeId, CmdbError, Page, PageRequest, RequestContext, Result,
};

use super::{required_text, validation_result, Orchestrator};
use crate::store::DeleteOutcome;

impl Orchestrator {
    pub async fn create_ci_type(
        &self,
        req: CreateCiTypeRequest,
        ctx: &RequestContext,
    ) -> Result<CiTypeDefinition> {
        self.traced("create_ci_type", async {
            required_text("name", &req.name)?;
            validation_result(validate_schema(
                &req.required_attributes,
                &req.optional_attributes,
            ))?;

            let now = Utc::now();
            let def = CiTypeDefinition {
                id: CiTypeId::new(),
                name: req.name.trim().to_string(),
                description: req.description,
                required_attributes: req.required_attributes,
                optional_attributes: req.optional_attributes,
                created_by: ctx.actor,
                created_at: now,
                updated_at: now,
            };
            let def = self.store.insert_ci_type(def).await?;

            self.record_audit(
                EntityType::CiType,
                def.id.0,
                AuditAction::Create,
                ctx,
                json!({ "ci_type_name": def.name }),
            )
            .await;
            tracing::info!(ci_type_id = %def.id, name = %def.name, "CI type created");
            Ok(def)
        })
        .await
    }

    pub async fn get_ci_type(&self, id: CiTypeId) -> Result<CiTypeDefinition> {
        self.store
            .get_ci_type(id)
            .await?
            .ok_or_else(|| CmdbError::not_found("CI type", id))
    }

    pub async fn get_ci_type_by_name(&self, name: &str) -> Result<CiTypeDefinition> {
        self.store
            .get_ci_type_by_name(name)
            .await?
            .ok_or_else(|| CmdbError::not_found("CI type", name))
    }

    pub async fn list_ci_types(
        &self,
        search: Option<&str>,
        page: Option<u32>,
        limit: Option<u32>,
    ) -> Result<Page<CiTypeDefinition>> {
        let page = PageRequest::from_query(page, limit, cmdb_core::pagination::DEFAULT_PAGE_SIZE);
        self.store.list_ci_types(search, page).await
    }

    /// The name is immutable. A schema change is refused with `Conflict` when
    /// an existing CI of the type would stop validating.
    pub async fn update_ci_type(
        &self,
        id: CiTypeId,
        req: UpdateCiTypeRequest,
        ctx: &RequestContext,
    ) -> Result<CiTypeDefinition> {
        self.traced("update_ci_type", async {
            let current = self.get_ci_type(id).await?;
            let schema_changed =
                req.required_attributes.is_some() || req.optional_attributes.is_some();

            let mut next = current.clone();
            if let Some(description) = &req.description {
                next.description = Some(description.clone());
            }
            if let Some(required) = &req.required_attributes {
                next.required_attributes = required.clone();
            }
            if let Some(optional) = &req.optional_attributes {
                next.optional_attributes = optional.clone();
            }
            next.updated_at = Utc::now();

            if schema_changed {
                validation_result(validate_schema(
                    &next.required_attributes,
                    &next.optional_attributes,
                ))?;
            }

            // Stored CIs are checked against `next` inside the store transaction.
            let def = self.store.update_ci_type(next).await?;
            self.record_audit(
                EntityType::CiType,
                def.id.0,
                AuditAction::Update,
                ctx,
                json!({ "ci_type_name": def.name, "changes": req }),
            )
            .await;
            tracing::info!(ci_type_id = %def.id, name = %def.name, "CI type updated");
            Ok(def)
        })
        .await
    }

    pub async fn delete_ci_type(&self, id: CiTypeId, ctx: &RequestContext) -> Result<()> {
        self.traced("delete_ci_type", async {
            match self.store.delete_ci_type_if_unused(id).await? {
                DeleteOutcome::Deleted(def) => {
                    self.record_audit(
                        EntityType::CiType,
                        def.id.0,
                        AuditAction::Delete,
                        ctx,
                        json!({ "ci_type_name": def.name }),
                    )
                    .await;
                    tracing::info!(ci_type_id = %id, name = %def.name, "CI type deleted");
                    Ok(())
                }
                DeleteOutcome::Referenced(_) => Err(CmdbError::Conflict(
                    "cannot delete CI type with existing CIs".into(),
                )),
                DeleteOutcome::Missing => Err(CmdbError::not_found("CI type", id)),
            }
        })
        .await
    }
}
