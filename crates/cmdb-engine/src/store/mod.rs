//! The Primary Store: the system of record for CI types, CIs and relationships.
//!
//! Every CI or relationship mutation also appends an [`OutboxEntry`] inside
//! the same transaction, so the graph mirror can always be replayed from
//! what was committed. Schema checks run inside that transaction too: a CI
//! is validated against the schema stored at commit time, and a schema
//! change is validated against the CIs stored at commit time.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cmdb_core::types::{CiFilter, RelationshipFilter};
use cmdb_core::validate::SchemaValidator;
use cmdb_core::{
    CiId, CiTypeDefinition, CiTypeId, CmdbError, ConfigurationItem, Page, PageRequest,
    Relationship, RelationshipId, Result, UserId,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

// ── Outbox ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct OutboxId(pub Uuid);

impl OutboxId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OutboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OutboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A graph mirror operation. Applying one re-reads the current truth for the id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", content = "id", rename_all = "snake_case")]
pub enum MirrorOp {
    UpsertCi(CiId),
    DeleteCi(CiId),
    UpsertRelationship(RelationshipId),
    DeleteRelationship(RelationshipId),
}

impl MirrorOp {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UpsertCi(_) => "upsert_ci",
            Self::DeleteCi(_) => "delete_ci",
            Self::UpsertRelationship(_) => "upsert_relationship",
            Self::DeleteRelationship(_) => "delete_relationship",
        }
    }

    /// Inverse of [`kind`](Self::kind).
    pub fn from_kind(kind: &str, id: Uuid) -> Option<Self> {
        match kind {
            "upsert_ci" => Some(Self::UpsertCi(CiId(id))),
            "delete_ci" => Some(Self::DeleteCi(CiId(id))),
            "upsert_relationship" => Some(Self::UpsertRelationship(RelationshipId(id))),
            "delete_relationship" => Some(Self::DeleteRelationship(RelationshipId(id))),
            _ => None,
        }
    }

    pub fn entity_id(&self) -> Uuid {
        match self {
            Self::UpsertCi(id) | Self::DeleteCi(id) => id.0,
            Self::UpsertRelationship(id) | Self::DeleteRelationship(id) => id.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboxEntry {
    pub id: OutboxId,
    pub op: MirrorOp,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OutboxEntry {
    pub fn new(op: MirrorOp) -> Self {
        let now = Utc::now();
        Self {
            id: OutboxId::new(),
            op,
            attempts: 0,
            next_attempt_at: now,
            last_error: None,
            created_at: now,
        }
    }
}

/// A committed write together with the outbox entry recorded for it.
#[derive(Debug, Clone)]
pub struct Committed<T> {
    pub value: T,
    pub outbox_id: OutboxId,
    pub op: MirrorOp,
}

/// Result of a conditional delete.
#[derive(Debug, Clone)]
pub enum DeleteOutcome<T> {
    Deleted(T),
    /// Still referenced by this many rows; nothing was deleted.
    Referenced(u64),
    Missing,
}

// ── Schema checks ─────────────────────────────────────────────────

/// How many offending CIs are named in a schema-update conflict.
pub const CONFLICT_SAMPLE: usize = 5;

/// Reject a CI row whose attributes do not satisfy `schema`.
pub(crate) fn check_attributes(schema: &CiTypeDefinition, ci: &ConfigurationItem) -> Result<()> {
    let errors = SchemaValidator::new(schema).validate(&ci.attributes);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(CmdbError::ValidationFailed(errors))
    }
}

pub(crate) fn schema_changed(current: &CiTypeDefinition, next: &CiTypeDefinition) -> bool {
    current.required_attributes != next.required_attributes
        || current.optional_attributes != next.optional_attributes
}

/// Names of the CIs in `cis` that `schema` would reject.
pub(crate) fn invalid_under<'a, I>(schema: &CiTypeDefinition, cis: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a ConfigurationItem>,
{
    let validator = SchemaValidator::new(schema);
    let mut names: Vec<String> = cis
        .into_iter()
        .filter(|ci| !validator.is_valid(&ci.attributes))
        .map(|ci| ci.name.clone())
        .collect();
    names.sort();
    names
}

pub(crate) fn schema_conflict(broken: &[String]) -> CmdbError {
    let sample: Vec<&str> = broken.iter().take(CONFLICT_SAMPLE).map(String::as_str).collect();
    CmdbError::Conflict(format!(
        "{} existing CI(s) would no longer validate against the new schema: {}",
        broken.len(),
        sample.join(", ")
    ))
}

// ── Users ─────────────────────────────────────────────────────────

/// A row of the `users` table. Authentication fields belong to the auth layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            id: UserId::new(),
            username: username.into(),
            email: None,
            created_at: Utc::now(),
        }
    }
}

// ── Contract ──────────────────────────────────────────────────────

/// Authoritative storage with referential integrity.
///
/// Client-visible rule violations come back as `NotFound`, `Conflict` or
/// `InvalidReference`. Anything else is `Internal`.
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    // CI types

    /// Fails with `Conflict` when the name is taken.
    async fn insert_ci_type(&self, def: CiTypeDefinition) -> Result<CiTypeDefinition>;

    async fn get_ci_type(&self, id: CiTypeId) -> Result<Option<CiTypeDefinition>>;

    async fn get_ci_type_by_name(&self, name: &str) -> Result<Option<CiTypeDefinition>>;

    /// Ordered by name; `search` matches name or description, case-insensitively.
    async fn list_ci_types(
        &self,
        search: Option<&str>,
        page: PageRequest,
    ) -> Result<Page<CiTypeDefinition>>;

    /// Name, creator and creation time are kept from the stored row. A changed
    /// attribute list fails with `Conflict` when a stored CI of the type would
    /// no longer validate.
    async fn update_ci_type(&self, def: CiTypeDefinition) -> Result<CiTypeDefinition>;

    /// Delete unless some CI still has this type.
    async fn delete_ci_type_if_unused(
        &self,
        id: CiTypeId,
    ) -> Result<DeleteOutcome<CiTypeDefinition>>;

    async fn count_ci_types(&self) -> Result<u64>;

    // CIs

    /// Fails with `NotFound` when the type is absent, `ValidationFailed` when
    /// the attributes do not satisfy the stored schema, and `Conflict` on a
    /// duplicate `(name, ci_type)`.
    async fn insert_ci(&self, ci: ConfigurationItem) -> Result<Committed<ConfigurationItem>>;

    async fn get_ci(&self, id: CiId) -> Result<Option<ConfigurationItem>>;

    async fn list_cis(&self, filter: &CiFilter, page: PageRequest) -> Result<Page<ConfigurationItem>>;

    async fn cis_of_type(&self, ci_type: &str) -> Result<Vec<ConfigurationItem>>;

    /// Replace the stored row, validated like an insert. Last write wins.
    async fn update_ci(&self, ci: ConfigurationItem) -> Result<Committed<ConfigurationItem>>;

    /// Check for referencing relationships and delete in one transaction.
    async fn delete_ci_if_unreferenced(
        &self,
        id: CiId,
    ) -> Result<DeleteOutcome<Committed<ConfigurationItem>>>;

    async fn count_cis(&self) -> Result<u64>;

    async fn all_cis(&self) -> Result<Vec<ConfigurationItem>>;

    // Relationships

    /// Fails with `InvalidReference` on a missing endpoint or a self-loop and
    /// `Conflict` on a duplicate `(source, target, type)`.
    async fn insert_relationship(&self, rel: Relationship) -> Result<Committed<Relationship>>;

    async fn get_relationship(&self, id: RelationshipId) -> Result<Option<Relationship>>;

    async fn list_relationships(
        &self,
        filter: &RelationshipFilter,
        page: PageRequest,
    ) -> Result<Page<Relationship>>;

    async fn update_relationship(&self, rel: Relationship) -> Result<Committed<Relationship>>;

    async fn delete_relationship(&self, id: RelationshipId) -> Result<Option<Committed<Relationship>>>;

    async fn count_relationships(&self) -> Result<u64>;

    async fn all_relationships(&self) -> Result<Vec<Relationship>>;

    // Users

    async fn insert_user(&self, user: User) -> Result<User>;

    async fn count_users(&self) -> Result<u64>;

    // Outbox

    /// Entries due at `now`, oldest first, at most `limit`.
    async fn pending_outbox(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OutboxEntry>>;

    async fn ack_outbox(&self, id: OutboxId) -> Result<()>;

    /// Record a failed attempt and reschedule. Returns the updated entry.
    async fn fail_outbox(
        &self,
        id: OutboxId,
        error: String,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<Option<OutboxEntry>>;

    async fn outbox_len(&self) -> Result<u64>;
}
