//! In-process audit sink, used when no audit directory is configured and in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::store::{AuditError, AuditSink, ChainHead};
use crate::{AuditId, AuditLogEntry};

#[derive(Default)]
struct State {
    entries: Vec<AuditLogEntry>,
    head: ChainHead,
}

/// Audit sink holding entries in memory, in append order.
#[derive(Default)]
pub struct MemoryAuditSink {
    state: Mutex<State>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, entry: AuditLogEntry) -> Result<AuditLogEntry, AuditError> {
        let mut state = self.state.lock().await;
        let sealed = entry.seal(&state.head);
        state.head = ChainHead::after(&sealed);
        state.entries.push(sealed.clone());
        Ok(sealed)
    }

    async fn get(&self, id: AuditId) -> Result<AuditLogEntry, AuditError> {
        let state = self.state.lock().await;
        let entry = state
            .entries
            .iter()
            .find(|e| e.id == id)
            .ok_or(AuditError::NotFound(id))?;
        if !entry.verify_integrity() {
            return Err(AuditError::IntegrityViolation(id));
        }
        Ok(entry.clone())
    }

    async fn entries(&self) -> Result<Vec<AuditLogEntry>, AuditError> {
        Ok(self.state.lock().await.entries.clone())
    }

    async fn delete(&self, id: AuditId) -> Result<(), AuditError> {
        let mut state = self.state.lock().await;
        let before = state.entries.len();
        state.entries.retain(|e| e.id != id);
        if state.entries.len() == before {
            return Err(AuditError::NotFound(id));
        }
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, AuditError> {
        let mut state = self.state.lock().await;
        let before = state.entries.len();
        state.entries.retain(|e| e.timestamp >= cutoff);
        Ok((before - state.entries.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::entry;
    use crate::{AuditAction, EntityType};

    #[tokio::test]
    async fn appends_in_order_and_chains() {
        let sink = MemoryAuditSink::new();
        let a = sink
            .append(entry(AuditAction::Create, EntityType::Ci))
            .await
            .unwrap();
        let b = sink
            .append(entry(AuditAction::Update, EntityType::Ci))
            .await
            .unwrap();

        assert_eq!(b.prev_hash, a.content_hash);
        let all = sink.entries().await.unwrap();
        assert_eq!(all.iter().map(|e| e.id).collect::<Vec<_>>(), vec![a.id, b.id]);
        assert_eq!(sink.get(b.id).await.unwrap(), b);
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let sink = MemoryAuditSink::new();
        assert!(matches!(
            sink.delete(AuditId::new()).await,
            Err(AuditError::NotFound(_))
        ));
        assert!(sink.is_empty().await);
    }
}
