//! The audit facade used by the orchestrator and the CLI.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use cmdb_core::config::AuditConfig;
use cmdb_core::{Page, RequestContext};

use crate::chain::{verify_chain, ChainReport};
use crate::query::{AuditFilter, AuditStats};
use crate::store::{AuditError, AuditSink};
use crate::{export, query, AuditAction, AuditId, AuditLogEntry, EntityType, FileAuditStore, MemoryAuditSink};

pub struct AuditService {
    sink: Arc<dyn AuditSink>,
    retention_days: i64,
    export_limit: usize,
}

impl AuditService {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        let defaults = AuditConfig::default();
        Self {
            sink,
            retention_days: defaults.retention_days,
            export_limit: defaults.export_limit,
        }
    }

    /// File-backed when `audit.dir` is set, in memory otherwise.
    pub fn from_config(config: &AuditConfig) -> Result<Self, AuditError> {
        let sink: Arc<dyn AuditSink> = match &config.dir {
            Some(dir) => Arc::new(FileAuditStore::open(dir)?),
            None => {
                tracing::warn!("No audit directory configured, audit entries are kept in memory");
                Arc::new(MemoryAuditSink::new())
            }
        };
        Ok(Self {
            sink,
            retention_days: config.retention_days,
            export_limit: config.export_limit,
        })
    }

    pub fn with_retention_days(mut self, days: i64) -> Self {
        self.retention_days = days;
        self
    }

    pub fn with_export_limit(mut self, limit: usize) -> Self {
        self.export_limit = limit;
        self
    }

    pub fn sink(&self) -> &Arc<dyn AuditSink> {
        &self.sink
    }

    /// Append a new entry for a mutation performed under `ctx`.
    pub async fn record(
        &self,
        entity_type: EntityType,
        entity_id: Option<Uuid>,
        action: AuditAction,
        ctx: &RequestContext,
        details: serde_json::Value,
    ) -> Result<AuditLogEntry, AuditError> {
        let entry = AuditLogEntry::new(entity_type, entity_id, action, ctx, details);
        let sealed = self.sink.append(entry).await?;
        tracing::debug!(
            audit_id = %sealed.id,
            entity_type = %entity_type,
            action = %action,
            sequence = sealed.sequence,
            "Audit entry recorded"
        );
        Ok(sealed)
    }

    pub async fn get(&self, id: AuditId) -> Result<AuditLogEntry, AuditError> {
        self.sink.get(id).await
    }

    pub async fn list(&self, filter: &AuditFilter) -> Result<Page<AuditLogEntry>, AuditError> {
        Ok(query::list(self.sink.entries().await?, filter))
    }

    pub async fn stats(&self, filter: &AuditFilter) -> Result<AuditStats, AuditError> {
        Ok(query::stats(self.sink.entries().await?, filter, Utc::now()))
    }

    /// Administrative purge of a single entry.
    pub async fn delete(&self, id: AuditId) -> Result<(), AuditError> {
        self.sink.delete(id).await?;
        tracing::warn!(audit_id = %id, "Audit entry purged by administrator");
        Ok(())
    }

    pub async fn delete_old(&self, older_than: DateTime<Utc>) -> Result<u64, AuditError> {
        let removed = self.sink.delete_older_than(older_than).await?;
        tracing::info!(removed, cutoff = %older_than, "Old audit entries deleted");
        Ok(removed)
    }

    /// Apply the configured retention window.
    pub async fn cleanup(&self) -> Result<u64, AuditError> {
        self.delete_old(Utc::now() - Duration::days(self.retention_days))
            .await
    }

    pub async fn export_csv(&self, filter: &AuditFilter) -> Result<String, AuditError> {
        Ok(export::to_csv(
            self.sink.entries().await?,
            filter,
            self.export_limit,
        ))
    }

    pub async fn verify_chain(&self) -> Result<ChainReport, AuditError> {
        let entries = self.sink.entries().await?;
        let report = verify_chain(&entries);
        match &report.first_break {
            Some(brk) => tracing::error!(
                audit_id = %brk.id,
                sequence = brk.sequence,
                reason = ?brk.reason,
                "Audit chain broken"
            ),
            None => tracing::info!(checked = report.checked, "Audit chain intact"),
        }
        Ok(report)
    }
}
