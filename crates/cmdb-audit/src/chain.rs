//! Hash chain verification.

use serde::{Deserialize, Serialize};

use crate::{AuditId, AuditLogEntry};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BreakReason {
    /// The entry's own content no longer matches its hash.
    ContentHash,
    /// The entry does not link to the entry stored before it.
    PrevHash,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainBreak {
    pub id: AuditId,
    pub sequence: u64,
    pub reason: BreakReason,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainReport {
    /// Entries examined before stopping.
    pub checked: usize,
    pub first_break: Option<ChainBreak>,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.first_break.is_none()
    }
}

/// Walk `entries` in sequence order and report the first break.
///
/// The oldest surviving entry is trusted to link to whatever preceded it,
/// since retention removes a prefix of the chain.
pub fn verify_chain(entries: &[AuditLogEntry]) -> ChainReport {
    let mut ordered: Vec<&AuditLogEntry> = entries.iter().collect();
    ordered.sort_by_key(|e| e.sequence);

    let mut prev: Option<&AuditLogEntry> = None;
    for (checked, entry) in ordered.iter().enumerate() {
        let reason = if !entry.verify_integrity() {
            Some(BreakReason::ContentHash)
        } else if prev.is_some_and(|p| entry.prev_hash != p.content_hash) {
            Some(BreakReason::PrevHash)
        } else {
            None
        };

        if let Some(reason) = reason {
            return ChainReport {
                checked,
                first_break: Some(ChainBreak {
                    id: entry.id,
                    sequence: entry.sequence,
                    reason,
                }),
            };
        }
        prev = Some(*entry);
    }

    ChainReport {
        checked: ordered.len(),
        first_break: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChainHead;
    use crate::tests::entry;
    use crate::{AuditAction, EntityType};

    fn chain(n: usize) -> Vec<AuditLogEntry> {
        let mut head = ChainHead::default();
        let mut out = Vec::new();
        for _ in 0..n {
            let sealed = entry(AuditAction::Update, EntityType::Ci).seal(&head);
            head = ChainHead::after(&sealed);
            out.push(sealed);
        }
        out
    }

    #[test]
    fn intact_chain_verifies() {
        let report = verify_chain(&chain(5));
        assert!(report.is_intact());
        assert_eq!(report.checked, 5);
        assert!(verify_chain(&[]).is_intact());
    }

    #[test]
    fn retention_prefix_removal_still_verifies() {
        let entries = chain(5);
        assert!(verify_chain(&entries[2..]).is_intact());
    }

    #[test]
    fn removed_middle_entry_is_detected() {
        let mut entries = chain(4);
        let removed = entries.remove(2);
        let report = verify_chain(&entries);
        let brk = report.first_break.unwrap();
        assert_eq!(brk.reason, BreakReason::PrevHash);
        assert_eq!(brk.sequence, removed.sequence + 1);
        assert_eq!(report.checked, 2);
    }

    #[test]
    fn edited_entry_is_detected() {
        let mut entries = chain(3);
        entries[1].user_agent = "forged".into();
        let brk = verify_chain(&entries).first_break.unwrap();
        assert_eq!(brk.reason, BreakReason::ContentHash);
        assert_eq!(brk.id, entries[1].id);
    }
}
