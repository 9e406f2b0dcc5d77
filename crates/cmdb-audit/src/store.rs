//! Audit storage: the sink contract shared by every backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use cmdb_core::CmdbError;

use crate::{AuditId, AuditLogEntry};

/// Errors that can occur during audit storage operations.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Audit log entry not found: {0}")]
    NotFound(AuditId),

    #[error("Integrity check failed for audit entry {0}: stored hash does not match content")]
    IntegrityViolation(AuditId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Audit store error: {0}")]
    Internal(String),
}

impl From<AuditError> for CmdbError {
    fn from(e: AuditError) -> Self {
        match e {
            AuditError::NotFound(id) => CmdbError::not_found("audit log entry", id),
            other => CmdbError::Internal(other.to_string()),
        }
    }
}

/// The tail of the hash chain: what the next appended entry links to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainHead {
    pub sequence: u64,
    pub hash: Option<String>,
}

impl ChainHead {
    pub fn after(entry: &AuditLogEntry) -> Self {
        Self {
            sequence: entry.sequence,
            hash: entry.content_hash.clone(),
        }
    }

    /// The head implied by a set of stored entries: the one with the highest sequence.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a AuditLogEntry>) -> Self {
        entries
            .into_iter()
            .max_by_key(|e| e.sequence)
            .map(Self::after)
            .unwrap_or_default()
    }
}

/// Append-only audit persistence.
///
/// Entries are never mutated after `append`. They leave the store only
/// through an explicit purge (`delete`) or age-based retention
/// (`delete_older_than`).
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Seal the entry onto the chain and persist it. Returns the stored entry.
    async fn append(&self, entry: AuditLogEntry) -> Result<AuditLogEntry, AuditError>;

    /// Retrieve an entry by id, verifying integrity.
    async fn get(&self, id: AuditId) -> Result<AuditLogEntry, AuditError>;

    /// Every stored entry in append order.
    async fn entries(&self) -> Result<Vec<AuditLogEntry>, AuditError>;

    async fn delete(&self, id: AuditId) -> Result<(), AuditError>;

    /// Remove entries with `timestamp < cutoff`. Returns how many were removed.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, AuditError>;
}
