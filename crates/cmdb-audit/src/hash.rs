//! BLAKE3 content hashing for tamper evidence.
//!
//! Computes a deterministic hash of all entry fields (excluding the
//! content_hash itself) so that any modification is detectable. The
//! previous entry's hash is part of the input, which chains entries.

use serde::Serialize;

use crate::AuditLogEntry;

/// Hashable representation of an entry (excludes content_hash).
#[derive(Serialize)]
struct HashableEntry<'a> {
    id: &'a crate::AuditId,
    entity_type: &'a crate::EntityType,
    entity_id: &'a Option<uuid::Uuid>,
    action: &'a crate::AuditAction,
    performed_by: &'a cmdb_core::UserId,
    timestamp: &'a chrono::DateTime<chrono::Utc>,
    details: &'a serde_json::Value,
    ip_address: &'a str,
    user_agent: &'a str,
    sequence: u64,
    prev_hash: &'a Option<String>,
}

/// Compute the BLAKE3 hash of an entry's content.
///
/// Serializes all fields except `content_hash` to JSON, then hashes the
/// bytes with BLAKE3. Returns the hex-encoded hash.
pub fn compute_entry_hash(entry: &AuditLogEntry) -> String {
    let hashable = HashableEntry {
        id: &entry.id,
        entity_type: &entry.entity_type,
        entity_id: &entry.entity_id,
        action: &entry.action,
        performed_by: &entry.performed_by,
        timestamp: &entry.timestamp,
        details: &entry.details,
        ip_address: &entry.ip_address,
        user_agent: &entry.user_agent,
        sequence: entry.sequence,
        prev_hash: &entry.prev_hash,
    };

    // Plain data with string keys always serializes.
    let json = serde_json::to_vec(&hashable).unwrap_or_default();
    blake3::hash(&json).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use crate::tests::entry;
    use crate::{AuditAction, EntityType};

    #[test]
    fn hash_is_deterministic() {
        let e = entry(AuditAction::Create, EntityType::Ci);
        assert_eq!(e.compute_hash(), e.compute_hash());
        assert_eq!(e.compute_hash().len(), 64);
    }

    #[test]
    fn hash_covers_chain_link() {
        let mut e = entry(AuditAction::Create, EntityType::Ci);
        let unlinked = e.compute_hash();
        e.prev_hash = Some("abc".into());
        assert_ne!(unlinked, e.compute_hash());
    }
}
