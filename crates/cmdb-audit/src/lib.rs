//! CMDB Audit: a tamper-evident record of every mutation.
//!
//! Each entry captures who changed what and when. Entries are chained:
//! every entry carries the BLAKE3 content hash of the one appended before
//! it, so edits, insertions and reordering are all detectable.

pub mod chain;
pub mod export;
pub mod file;
pub mod hash;
pub mod memory;
pub mod query;
pub mod service;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cmdb_core::{RequestContext, UserId};

pub use chain::{verify_chain, BreakReason, ChainBreak, ChainReport};
pub use file::FileAuditStore;
pub use memory::MemoryAuditSink;
pub use query::{AuditFilter, AuditSortField, AuditStats};
pub use service::AuditService;
pub use store::{AuditError, AuditSink, ChainHead};

pub type Result<T> = std::result::Result<T, AuditError>;

// ── Core Types ───────────────────────────────────────────────────

/// Unique identifier for an audit entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct AuditId(pub Uuid);

impl AuditId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AuditId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AuditId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for AuditId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Ci,
    CiType,
    Relationship,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ci => "ci",
            Self::CiType => "ci_type",
            Self::Relationship => "relationship",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable record of a mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditLogEntry {
    pub id: AuditId,
    pub entity_type: EntityType,
    pub entity_id: Option<Uuid>,
    pub action: AuditAction,
    pub performed_by: UserId,
    pub timestamp: DateTime<Utc>,
    /// Action-specific payload, always a JSON object.
    pub details: serde_json::Value,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub user_agent: String,
    /// Position in append order, assigned by the sink.
    #[serde(default)]
    pub sequence: u64,
    /// Content hash of the previously appended entry.
    #[serde(default)]
    pub prev_hash: Option<String>,
    /// BLAKE3 hash (hex) over every other field, set when appended.
    #[serde(default)]
    pub content_hash: Option<String>,
}

impl AuditLogEntry {
    /// A new, not yet appended entry stamped with the current time.
    pub fn new(
        entity_type: EntityType,
        entity_id: Option<Uuid>,
        action: AuditAction,
        ctx: &RequestContext,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: AuditId::new(),
            entity_type,
            entity_id,
            action,
            performed_by: ctx.actor,
            timestamp: Utc::now(),
            details,
            ip_address: ctx.ip_address.clone(),
            user_agent: ctx.user_agent.clone(),
            sequence: 0,
            prev_hash: None,
            content_hash: None,
        }
    }

    /// Link this entry after `head` and stamp its content hash.
    pub fn seal(mut self, head: &ChainHead) -> Self {
        self.sequence = head.sequence + 1;
        self.prev_hash = head.hash.clone();
        self.content_hash = Some(self.compute_hash());
        self
    }

    /// Compute the BLAKE3 hash of the entry's content.
    /// The hash covers all fields except `content_hash` itself.
    pub fn compute_hash(&self) -> String {
        hash::compute_entry_hash(self)
    }

    /// Verify that the stored content_hash matches a freshly computed hash.
    pub fn verify_integrity(&self) -> bool {
        match &self.content_hash {
            Some(stored) => stored == &self.compute_hash(),
            None => false,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn entry(action: AuditAction, entity_type: EntityType) -> AuditLogEntry {
        let ctx = RequestContext::new(UserId::new()).with_client("10.1.1.1", "cmdb-test/1.0");
        AuditLogEntry::new(
            entity_type,
            Some(Uuid::new_v4()),
            action,
            &ctx,
            serde_json::json!({"ci_name": "web-1", "ci_type": "Server"}),
        )
    }

    #[test]
    fn sealing_links_to_head() {
        let first = entry(AuditAction::Create, EntityType::Ci).seal(&ChainHead::default());
        assert_eq!(first.sequence, 1);
        assert!(first.prev_hash.is_none());
        assert!(first.verify_integrity());

        let head = ChainHead::after(&first);
        let second = entry(AuditAction::Update, EntityType::Ci).seal(&head);
        assert_eq!(second.sequence, 2);
        assert_eq!(second.prev_hash, first.content_hash);
        assert!(second.verify_integrity());
    }

    #[test]
    fn tampering_breaks_integrity() {
        let mut sealed = entry(AuditAction::Delete, EntityType::Relationship).seal(&ChainHead::default());
        sealed.details = serde_json::json!({"ci_name": "other"});
        assert!(!sealed.verify_integrity());
    }

    #[test]
    fn unsealed_entry_is_not_intact() {
        assert!(!entry(AuditAction::Create, EntityType::CiType).verify_integrity());
    }

    #[test]
    fn wire_names() {
        assert_eq!(serde_json::to_string(&EntityType::CiType).unwrap(), "\"ci_type\"");
        assert_eq!(serde_json::to_string(&AuditAction::Update).unwrap(), "\"update\"");
        assert_eq!(EntityType::Relationship.to_string(), "relationship");
    }
}
