//! In-process relational store used as a test double for [`SqliteStore`](super::SqliteStore).

use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use cmdb_core::types::{CiFilter, CiSortField, RelationshipFilter, RelationshipSortField, SortOrder};
use cmdb_core::{
    CiId, CiTypeDefinition, CiTypeId, CmdbError, ConfigurationItem, Page, PageRequest,
    Relationship, RelationshipId, Result, UserId,
};

use super::{
    check_attributes, invalid_under, schema_changed, schema_conflict, Committed, DeleteOutcome,
    MirrorOp, OutboxEntry, OutboxId, PrimaryStore, User,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    users: HashMap<UserId, User>,
    ci_types: HashMap<CiTypeId, CiTypeDefinition>,
    cis: HashMap<CiId, ConfigurationItem>,
    relationships: HashMap<RelationshipId, Relationship>,
    outbox: HashMap<OutboxId, OutboxEntry>,
}

// ── Integrity rules ───────────────────────────────────────────────

impl Tables {
    fn enqueue(&mut self, op: MirrorOp) -> OutboxId {
        let entry = OutboxEntry::new(op);
        let id = entry.id;
        self.outbox.insert(id, entry);
        id
    }

    fn committed<T>(&mut self, value: T, op: MirrorOp) -> Committed<T> {
        let outbox_id = self.enqueue(op);
        Committed {
            value,
            outbox_id,
            op,
        }
    }

    fn type_named(&self, name: &str) -> Option<&CiTypeDefinition> {
        self.ci_types.values().find(|t| t.name == name)
    }

    fn ci_type_usage(&self, name: &str) -> u64 {
        self.cis.values().filter(|c| c.ci_type == name).count() as u64
    }

    fn references_to(&self, id: CiId) -> u64 {
        self.relationships
            .values()
            .filter(|r| r.source_id == id || r.target_id == id)
            .count() as u64
    }

    fn insert_ci_type(&mut self, def: CiTypeDefinition) -> Result<CiTypeDefinition> {
        if self.type_named(&def.name).is_some() {
            return Err(CmdbError::Conflict(format!(
                "CI type '{}' already exists",
                def.name
            )));
        }
        self.ci_types.insert(def.id, def.clone());
        Ok(def)
    }

    fn update_ci_type(&mut self, mut def: CiTypeDefinition) -> Result<CiTypeDefinition> {
        let current = self
            .ci_types
            .get(&def.id)
            .ok_or_else(|| CmdbError::not_found("CI type", def.id))?;
        def.name = current.name.clone();
        def.created_by = current.created_by;
        def.created_at = current.created_at;
        if schema_changed(current, &def) {
            let broken = invalid_under(&def, self.cis.values().filter(|c| c.ci_type == def.name));
            if !broken.is_empty() {
                return Err(schema_conflict(&broken));
            }
        }
        self.ci_types.insert(def.id, def.clone());
        Ok(def)
    }

    fn delete_ci_type_if_unused(&mut self, id: CiTypeId) -> DeleteOutcome<CiTypeDefinition> {
        let Some(def) = self.ci_types.get(&id) else {
            return DeleteOutcome::Missing;
        };
        let usage = self.ci_type_usage(&def.name);
        if usage > 0 {
            return DeleteOutcome::Referenced(usage);
        }
        match self.ci_types.remove(&id) {
            Some(def) => DeleteOutcome::Deleted(def),
            None => DeleteOutcome::Missing,
        }
    }

    fn check_ci_row(&self, ci: &ConfigurationItem) -> Result<()> {
        let schema = self
            .type_named(&ci.ci_type)
            .ok_or_else(|| CmdbError::not_found("CI type", &ci.ci_type))?;
        check_attributes(schema, ci)?;
        let duplicate = self
            .cis
            .values()
            .any(|c| c.id != ci.id && c.name == ci.name && c.ci_type == ci.ci_type);
        if duplicate {
            return Err(CmdbError::Conflict(format!(
                "CI '{}' already exists for type '{}'",
                ci.name, ci.ci_type
            )));
        }
        Ok(())
    }

    fn insert_ci(&mut self, ci: ConfigurationItem) -> Result<Committed<ConfigurationItem>> {
        self.check_ci_row(&ci)?;
        if self.cis.contains_key(&ci.id) {
            return Err(CmdbError::Conflict(format!("CI {} already exists", ci.id)));
        }
        let id = ci.id;
        self.cis.insert(id, ci.clone());
        Ok(self.committed(ci, MirrorOp::UpsertCi(id)))
    }

    fn update_ci(&mut self, ci: ConfigurationItem) -> Result<Committed<ConfigurationItem>> {
        if !self.cis.contains_key(&ci.id) {
            return Err(CmdbError::not_found("CI", ci.id));
        }
        self.check_ci_row(&ci)?;
        let id = ci.id;
        self.cis.insert(id, ci.clone());
        Ok(self.committed(ci, MirrorOp::UpsertCi(id)))
    }

    fn delete_ci_if_unreferenced(&mut self, id: CiId) -> DeleteOutcome<Committed<ConfigurationItem>> {
        if !self.cis.contains_key(&id) {
            return DeleteOutcome::Missing;
        }
        let refs = self.references_to(id);
        if refs > 0 {
            return DeleteOutcome::Referenced(refs);
        }
        match self.cis.remove(&id) {
            Some(ci) => DeleteOutcome::Deleted(self.committed(ci, MirrorOp::DeleteCi(id))),
            None => DeleteOutcome::Missing,
        }
    }

    fn check_relationship_row(&self, rel: &Relationship) -> Result<()> {
        if rel.source_id == rel.target_id {
            return Err(CmdbError::InvalidReference(
                "a CI cannot have a relationship with itself".into(),
            ));
        }
        if !self.cis.contains_key(&rel.source_id) {
            return Err(CmdbError::InvalidReference(format!(
                "source CI {} does not exist",
                rel.source_id
            )));
        }
        if !self.cis.contains_key(&rel.target_id) {
            return Err(CmdbError::InvalidReference(format!(
                "target CI {} does not exist",
                rel.target_id
            )));
        }
        let duplicate = self.relationships.values().any(|r| {
            r.id != rel.id
                && r.source_id == rel.source_id
                && r.target_id == rel.target_id
                && r.relationship_type == rel.relationship_type
        });
        if duplicate {
            return Err(CmdbError::Conflict(format!(
                "relationship '{}' from {} to {} already exists",
                rel.relationship_type, rel.source_id, rel.target_id
            )));
        }
        Ok(())
    }

    fn insert_relationship(&mut self, rel: Relationship) -> Result<Committed<Relationship>> {
        self.check_relationship_row(&rel)?;
        let id = rel.id;
        self.relationships.insert(id, rel.clone());
        Ok(self.committed(rel, MirrorOp::UpsertRelationship(id)))
    }

    fn update_relationship(&mut self, mut rel: Relationship) -> Result<Committed<Relationship>> {
        let current = self
            .relationships
            .get(&rel.id)
            .ok_or_else(|| CmdbError::not_found("relationship", rel.id))?;
        // Endpoints and type never change after creation.
        rel.source_id = current.source_id;
        rel.target_id = current.target_id;
        rel.relationship_type = current.relationship_type.clone();
        rel.created_by = current.created_by;
        rel.created_at = current.created_at;
        let id = rel.id;
        self.relationships.insert(id, rel.clone());
        Ok(self.committed(rel, MirrorOp::UpsertRelationship(id)))
    }

    fn delete_relationship(&mut self, id: RelationshipId) -> Option<Committed<Relationship>> {
        let rel = self.relationships.remove(&id)?;
        Some(self.committed(rel, MirrorOp::DeleteRelationship(id)))
    }
}

// ── Listing ───────────────────────────────────────────────────────

fn contains_folded(needle: &str, haystack: &str) -> bool {
    haystack.to_lowercase().contains(needle)
}

fn search_term(search: Option<&str>) -> Option<String> {
    search
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase)
}

fn ci_matches(ci: &ConfigurationItem, filter: &CiFilter, term: Option<&str>) -> bool {
    if let Some(t) = &filter.ci_type {
        if &ci.ci_type != t {
            return false;
        }
    }
    if let Some(who) = &filter.created_by {
        if &ci.created_by != who {
            return false;
        }
    }
    if !filter.tags.is_empty() && !filter.tags.iter().any(|t| ci.tags.contains(t)) {
        return false;
    }
    if let Some(term) = term {
        let attrs = serde_json::to_string(&ci.attributes).unwrap_or_default();
        if !contains_folded(term, &ci.name) && !contains_folded(term, &attrs) {
            return false;
        }
    }
    true
}

fn ordered(ord: Ordering, order: SortOrder) -> Ordering {
    match order {
        SortOrder::Asc => ord,
        SortOrder::Desc => ord.reverse(),
    }
}

fn compare_cis(a: &ConfigurationItem, b: &ConfigurationItem, field: CiSortField) -> Ordering {
    let primary = match field {
        CiSortField::Name => a.name.cmp(&b.name),
        CiSortField::CiType => a.ci_type.cmp(&b.ci_type),
        CiSortField::CreatedAt => a.created_at.cmp(&b.created_at),
        CiSortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
    };
    primary.then_with(|| a.id.cmp(&b.id))
}

fn relationship_matches(rel: &Relationship, filter: &RelationshipFilter, term: Option<&str>) -> bool {
    if filter.source_id.is_some_and(|id| rel.source_id != id) {
        return false;
    }
    if filter.target_id.is_some_and(|id| rel.target_id != id) {
        return false;
    }
    if let Some(t) = &filter.relationship_type {
        if &rel.relationship_type != t {
            return false;
        }
    }
    match term {
        Some(term) => contains_folded(term, &rel.relationship_type),
        None => true,
    }
}

fn compare_relationships(a: &Relationship, b: &Relationship, field: RelationshipSortField) -> Ordering {
    let primary = match field {
        RelationshipSortField::CreatedAt => a.created_at.cmp(&b.created_at),
        RelationshipSortField::RelationshipType => a.relationship_type.cmp(&b.relationship_type),
    };
    primary.then_with(|| a.id.cmp(&b.id))
}

// ── Store ─────────────────────────────────────────────────────────

/// A [`PrimaryStore`] holding every table under one `RwLock`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn write<T, F>(&self, f: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(&mut Tables) -> Result<T> + Send,
    {
        let mut tables = self.tables.write().await;
        f(&mut tables)
    }
}

#[async_trait]
impl PrimaryStore for MemoryStore {
    async fn insert_ci_type(&self, def: CiTypeDefinition) -> Result<CiTypeDefinition> {
        self.write(move |t| t.insert_ci_type(def)).await
    }

    async fn get_ci_type(&self, id: CiTypeId) -> Result<Option<CiTypeDefinition>> {
        Ok(self.tables.read().await.ci_types.get(&id).cloned())
    }

    async fn get_ci_type_by_name(&self, name: &str) -> Result<Option<CiTypeDefinition>> {
        Ok(self.tables.read().await.type_named(name).cloned())
    }

    async fn list_ci_types(
        &self,
        search: Option<&str>,
        page: PageRequest,
    ) -> Result<Page<CiTypeDefinition>> {
        let term = search_term(search);
        let tables = self.tables.read().await;
        let mut types: Vec<CiTypeDefinition> = tables
            .ci_types
            .values()
            .filter(|t| match &term {
                Some(term) => {
                    contains_folded(term, &t.name)
                        || t.description.as_deref().is_some_and(|d| contains_folded(term, d))
                }
                None => true,
            })
            .cloned()
            .collect();
        types.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(page.apply(types))
    }

    async fn update_ci_type(&self, def: CiTypeDefinition) -> Result<CiTypeDefinition> {
        self.write(move |t| t.update_ci_type(def)).await
    }

    async fn delete_ci_type_if_unused(
        &self,
        id: CiTypeId,
    ) -> Result<DeleteOutcome<CiTypeDefinition>> {
        self.write(move |t| Ok(t.delete_ci_type_if_unused(id))).await
    }

    async fn count_ci_types(&self) -> Result<u64> {
        Ok(self.tables.read().await.ci_types.len() as u64)
    }

    async fn insert_ci(&self, ci: ConfigurationItem) -> Result<Committed<ConfigurationItem>> {
        self.write(move |t| t.insert_ci(ci)).await
    }

    async fn get_ci(&self, id: CiId) -> Result<Option<ConfigurationItem>> {
        Ok(self.tables.read().await.cis.get(&id).cloned())
    }

    async fn list_cis(&self, filter: &CiFilter, page: PageRequest) -> Result<Page<ConfigurationItem>> {
        let term = search_term(filter.search.as_deref());
        let tables = self.tables.read().await;
        let mut cis: Vec<ConfigurationItem> = tables
            .cis
            .values()
            .filter(|c| ci_matches(c, filter, term.as_deref()))
            .cloned()
            .collect();
        cis.sort_by(|a, b| ordered(compare_cis(a, b, filter.sort), filter.order));
        Ok(page.apply(cis))
    }

    async fn cis_of_type(&self, ci_type: &str) -> Result<Vec<ConfigurationItem>> {
        let tables = self.tables.read().await;
        let mut cis: Vec<ConfigurationItem> = tables
            .cis
            .values()
            .filter(|c| c.ci_type == ci_type)
            .cloned()
            .collect();
        cis.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(cis)
    }

    async fn update_ci(&self, ci: ConfigurationItem) -> Result<Committed<ConfigurationItem>> {
        self.write(move |t| t.update_ci(ci)).await
    }

    async fn delete_ci_if_unreferenced(
        &self,
        id: CiId,
    ) -> Result<DeleteOutcome<Committed<ConfigurationItem>>> {
        self.write(move |t| Ok(t.delete_ci_if_unreferenced(id))).await
    }

    async fn count_cis(&self) -> Result<u64> {
        Ok(self.tables.read().await.cis.len() as u64)
    }

    async fn all_cis(&self) -> Result<Vec<ConfigurationItem>> {
        let mut cis: Vec<_> = self.tables.read().await.cis.values().cloned().collect();
        cis.sort_by_key(|c| c.id);
        Ok(cis)
    }

    async fn insert_relationship(&self, rel: Relationship) -> Result<Committed<Relationship>> {
        self.write(move |t| t.insert_relationship(rel)).await
    }

    async fn get_relationship(&self, id: RelationshipId) -> Result<Option<Relationship>> {
        Ok(self.tables.read().await.relationships.get(&id).cloned())
    }

    async fn list_relationships(
        &self,
        filter: &RelationshipFilter,
        page: PageRequest,
    ) -> Result<Page<Relationship>> {
        let term = search_term(filter.search.as_deref());
        let tables = self.tables.read().await;
        let mut rels: Vec<Relationship> = tables
            .relationships
            .values()
            .filter(|r| relationship_matches(r, filter, term.as_deref()))
            .cloned()
            .collect();
        rels.sort_by(|a, b| ordered(compare_relationships(a, b, filter.sort), filter.order));
        Ok(page.apply(rels))
    }

    async fn update_relationship(&self, rel: Relationship) -> Result<Committed<Relationship>> {
        self.write(move |t| t.update_relationship(rel)).await
    }

    async fn delete_relationship(&self, id: RelationshipId) -> Result<Option<Committed<Relationship>>> {
        self.write(move |t| Ok(t.delete_relationship(id))).await
    }

    async fn count_relationships(&self) -> Result<u64> {
        Ok(self.tables.read().await.relationships.len() as u64)
    }

    async fn all_relationships(&self) -> Result<Vec<Relationship>> {
        let mut rels: Vec<_> = self
            .tables
            .read()
            .await
            .relationships
            .values()
            .cloned()
            .collect();
        rels.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(rels)
    }

    async fn insert_user(&self, user: User) -> Result<User> {
        self.write(move |t| {
            if t.users.values().any(|u| u.username == user.username) {
                return Err(CmdbError::Conflict(format!(
                    "user '{}' already exists",
                    user.username
                )));
            }
            t.users.insert(user.id, user.clone());
            Ok(user)
        })
        .await
    }

    async fn count_users(&self) -> Result<u64> {
        Ok(self.tables.read().await.users.len() as u64)
    }

    async fn pending_outbox(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OutboxEntry>> {
        let tables = self.tables.read().await;
        let mut due: Vec<OutboxEntry> = tables
            .outbox
            .values()
            .filter(|e| e.next_attempt_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn ack_outbox(&self, id: OutboxId) -> Result<()> {
        self.write(move |t| {
            t.outbox.remove(&id);
            Ok(())
        })
        .await
    }

    async fn fail_outbox(
        &self,
        id: OutboxId,
        error: String,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<Option<OutboxEntry>> {
        self.write(move |t| {
            Ok(t.outbox.get_mut(&id).map(|entry| {
                entry.attempts += 1;
                entry.last_error = Some(error);
                entry.next_attempt_at = next_attempt_at;
                entry.clone()
            }))
        })
        .await
    }

    async fn outbox_len(&self) -> Result<u64> {
        Ok(self.tables.read().await.outbox.len() as u64)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use cmdb_core::types::normalize_tags;
    use cmdb_core::{AttrValue, AttributeDefinition, AttributeType, Attributes};

    pub(crate) fn ci_type(name: &str) -> CiTypeDefinition {
        let now = Utc::now();
        CiTypeDefinition {
            id: CiTypeId::new(),
            name: name.to_string(),
            description: Some(format!("{name} assets")),
            required_attributes: vec![AttributeDefinition::new("hostname", AttributeType::String)],
            optional_attributes: vec![],
            created_by: UserId::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn ci(name: &str, ci_type: &str) -> ConfigurationItem {
        let now = Utc::now();
        let mut attributes = Attributes::new();
        attributes.insert("hostname".into(), AttrValue::from(name));
        ConfigurationItem {
            id: CiId::new(),
            name: name.to_string(),
            ci_type: ci_type.to_string(),
            attributes,
            tags: normalize_tags(["prod"]),
            created_by: UserId::new(),
            created_at: now,
            updated_by: None,
            updated_at: now,
        }
    }

    pub(crate) fn relationship(source: CiId, target: CiId, kind: &str) -> Relationship {
        Relationship {
            id: RelationshipId::new(),
            source_id: source,
            target_id: target,
            relationship_type: kind.to_string(),
            attributes: Attributes::new(),
            created_by: UserId::new(),
            created_at: Utc::now(),
            updated_by: None,
            updated_at: None,
        }
    }

    async fn seeded() -> (MemoryStore, ConfigurationItem, ConfigurationItem) {
        let store = MemoryStore::new();
        store.insert_ci_type(ci_type("Server")).await.unwrap();
        let a = store.insert_ci(ci("web-1", "Server")).await.unwrap().value;
        let b = store.insert_ci(ci("db-1", "Server")).await.unwrap().value;
        (store, a, b)
    }

    #[tokio::test]
    async fn ci_rows_require_type_and_unique_name() {
        let (store, _, _) = seeded().await;

        let err = store.insert_ci(ci("x", "Router")).await.unwrap_err();
        assert!(matches!(err, CmdbError::NotFound { entity: "CI type", .. }));

        let err = store.insert_ci(ci("web-1", "Server")).await.unwrap_err();
        assert!(matches!(err, CmdbError::Conflict(_)));

        let err = store.insert_ci_type(ci_type("Server")).await.unwrap_err();
        assert!(matches!(err, CmdbError::Conflict(_)));
    }

    #[tokio::test]
    async fn relationship_rows_enforce_endpoints() {
        let (store, a, b) = seeded().await;

        let err = store
            .insert_relationship(relationship(a.id, a.id, "depends_on"))
            .await
            .unwrap_err();
        assert!(matches!(err, CmdbError::InvalidReference(_)));

        let err = store
            .insert_relationship(relationship(a.id, CiId::new(), "depends_on"))
            .await
            .unwrap_err();
        assert!(matches!(err, CmdbError::InvalidReference(_)));

        store
            .insert_relationship(relationship(a.id, b.id, "depends_on"))
            .await
            .unwrap();
        let err = store
            .insert_relationship(relationship(a.id, b.id, "depends_on"))
            .await
            .unwrap_err();
        assert!(matches!(err, CmdbError::Conflict(_)));

        // Same endpoints, different type is a distinct edge.
        store
            .insert_relationship(relationship(a.id, b.id, "connects_to"))
            .await
            .unwrap();
        assert_eq!(store.count_relationships().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn conditional_delete_respects_references() {
        let (store, a, b) = seeded().await;
        let rel = store
            .insert_relationship(relationship(a.id, b.id, "depends_on"))
            .await
            .unwrap()
            .value;

        assert!(matches!(
            store.delete_ci_if_unreferenced(b.id).await.unwrap(),
            DeleteOutcome::Referenced(1)
        ));
        assert!(store.get_ci(b.id).await.unwrap().is_some());

        store.delete_relationship(rel.id).await.unwrap().unwrap();
        match store.delete_ci_if_unreferenced(b.id).await.unwrap() {
            DeleteOutcome::Deleted(c) => assert_eq!(c.op, MirrorOp::DeleteCi(b.id)),
            other => panic!("expected delete, got {other:?}"),
        }
        assert!(matches!(
            store.delete_ci_if_unreferenced(b.id).await.unwrap(),
            DeleteOutcome::Missing
        ));
    }

    #[tokio::test]
    async fn ci_type_delete_blocked_while_used() {
        let (store, a, b) = seeded().await;
        let server = store.get_ci_type_by_name("Server").await.unwrap().unwrap();

        assert!(matches!(
            store.delete_ci_type_if_unused(server.id).await.unwrap(),
            DeleteOutcome::Referenced(2)
        ));

        store.delete_ci_if_unreferenced(a.id).await.unwrap();
        store.delete_ci_if_unreferenced(b.id).await.unwrap();
        assert!(matches!(
            store.delete_ci_type_if_unused(server.id).await.unwrap(),
            DeleteOutcome::Deleted(_)
        ));
    }

    #[tokio::test]
    async fn relationship_update_keeps_identity_fields() {
        let (store, a, b) = seeded().await;
        let rel = store
            .insert_relationship(relationship(a.id, b.id, "depends_on"))
            .await
            .unwrap()
            .value;

        let mut patched = rel.clone();
        patched.relationship_type = "owns".into();
        patched.source_id = b.id;
        patched.attributes.insert("weight".into(), AttrValue::from(3));
        let updated = store.update_relationship(patched).await.unwrap().value;

        assert_eq!(updated.relationship_type, "depends_on");
        assert_eq!(updated.source_id, a.id);
        assert_eq!(updated.attributes.get("weight"), Some(&AttrValue::Integer(3)));
    }

    #[tokio::test]
    async fn list_cis_filters_sorts_and_pages() {
        let (store, _, _) = seeded().await;
        let mut tagged = ci("cache-1", "Server");
        tagged.tags = normalize_tags(["staging"]);
        store.insert_ci(tagged).await.unwrap();

        let by_name = CiFilter {
            sort: CiSortField::Name,
            order: SortOrder::Asc,
            ..Default::default()
        };
        let page = store.list_cis(&by_name, PageRequest::new(1, 2)).await.unwrap();
        let names: Vec<&str> = page.items.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["cache-1", "db-1"]);
        assert_eq!(page.pagination.total, 3);
        assert_eq!(page.pagination.total_pages, 2);

        let staging = CiFilter {
            tags: vec!["staging".into(), "missing".into()],
            ..Default::default()
        };
        assert_eq!(store.list_cis(&staging, PageRequest::default()).await.unwrap().items.len(), 1);

        // Search covers attribute text as well as the name.
        let search = CiFilter {
            search: Some("WEB".into()),
            ..Default::default()
        };
        let found = store.list_cis(&search, PageRequest::default()).await.unwrap();
        assert_eq!(found.items.len(), 1);
        assert_eq!(found.items[0].name, "web-1");
    }

    #[tokio::test]
    async fn list_ci_types_searches_description() {
        let store = MemoryStore::new();
        store.insert_ci_type(ci_type("Server")).await.unwrap();
        store.insert_ci_type(ci_type("Application")).await.unwrap();

        let all = store.list_ci_types(None, PageRequest::default()).await.unwrap();
        let names: Vec<&str> = all.items.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Application", "Server"]);

        let hits = store
            .list_ci_types(Some("server assets"), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(hits.pagination.total, 1);
    }

    #[tokio::test]
    async fn every_mutation_enqueues_outbox() {
        let (store, a, b) = seeded().await;
        assert_eq!(store.outbox_len().await.unwrap(), 2);

        let rel = store
            .insert_relationship(relationship(a.id, b.id, "depends_on"))
            .await
            .unwrap();
        let pending = store.pending_outbox(Utc::now(), 10).await.unwrap();
        assert_eq!(pending.len(), 3);
        assert!(pending.iter().any(|e| e.id == rel.outbox_id));

        let later = Utc::now() + chrono::Duration::seconds(60);
        let failed = store
            .fail_outbox(rel.outbox_id, "graph down".into(), later)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.attempts, 1);
        assert_eq!(store.pending_outbox(Utc::now(), 10).await.unwrap().len(), 2);

        store.ack_outbox(rel.outbox_id).await.unwrap();
        assert_eq!(store.outbox_len().await.unwrap(), 2);
        assert!(store
            .fail_outbox(rel.outbox_id, "late".into(), later)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn ci_rows_are_checked_against_the_stored_schema() {
        let (store, a, _) = seeded().await;

        let mut blank = ci("web-2", "Server");
        blank.attributes.clear();
        let err = store.insert_ci(blank).await.unwrap_err();
        assert_eq!(err.validation_errors()[0].field, "hostname");

        let mut stray = a.clone();
        stray.attributes.insert("rack".into(), AttrValue::from("r1"));
        let err = store.update_ci(stray).await.unwrap_err();
        assert_eq!(err.validation_errors()[0].field, "rack");
        assert_eq!(store.get_ci(a.id).await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn schema_change_refused_while_stored_cis_break_it() {
        let (store, _, _) = seeded().await;
        let server = store.get_ci_type_by_name("Server").await.unwrap().unwrap();

        let mut stricter = server.clone();
        stricter
            .required_attributes
            .push(AttributeDefinition::new("rack", AttributeType::String));
        let err = store.update_ci_type(stricter).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Conflict: 2 existing CI(s) would no longer validate against the new schema: db-1, web-1"
        );

        let mut described = server.clone();
        described.description = Some("racked hosts".into());
        let updated = store.update_ci_type(described).await.unwrap();
        assert_eq!(updated.description.as_deref(), Some("racked hosts"));
    }
}
