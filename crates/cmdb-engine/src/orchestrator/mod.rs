//! The Consistency Orchestrator.
//!
//! Sequences every write as: Primary Store commit, then graph mirror, then
//! cache invalidation, then audit append. Only the Primary Store commit can
//! fail the call. The mirror is backed by the outbox row committed with the
//! write, so a failed or abandoned mirror attempt is retried by the
//! [`MirrorWorker`](crate::mirror::MirrorWorker).

mod ci_types;
mod cis;
mod graph;
mod relationships;

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{Instrument, Span};
use uuid::Uuid;

use cmdb_audit::{AuditAction, AuditService, EntityType};
use cmdb_core::config::CmdbConfig;
use cmdb_core::types::DashboardStats;
use cmdb_core::{CiId, CmdbError, RequestContext, Result, ValidationError};
use cmdb_graph::GraphIndex;

use crate::cache::{ci_key, Cache, CacheStats};
use crate::mirror::{self, MirrorGate, RetryPolicy};
use crate::reconcile::{self, ReconcileReport};
use crate::store::{Committed, PrimaryStore};

/// Bounds applied to graph read parameters.
pub const MAX_GRAPH_LIMIT: usize = 500;
pub const MAX_NETWORK_DEPTH: usize = 5;

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorOptions {
    pub cache_ttl: Duration,
    /// Deadline for each secondary-store call (graph, cache) on the write path.
    pub store_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self::from(&CmdbConfig::default())
    }
}

impl From<&CmdbConfig> for OrchestratorOptions {
    fn from(c: &CmdbConfig) -> Self {
        Self {
            cache_ttl: c.cache.ttl(),
            store_timeout: c.orchestrator.store_timeout(),
            retry: RetryPolicy::from(&c.mirror),
        }
    }
}

pub struct Orchestrator {
    store: Arc<dyn PrimaryStore>,
    graph: Arc<dyn GraphIndex>,
    cache: Arc<dyn Cache>,
    audit: Arc<AuditService>,
    gate: MirrorGate,
    options: OrchestratorOptions,
    span: Span,
}

impl Orchestrator {
    /// Every operation runs in a child span of `span`.
    pub fn new(
        store: Arc<dyn PrimaryStore>,
        graph: Arc<dyn GraphIndex>,
        cache: Arc<dyn Cache>,
        audit: Arc<AuditService>,
        span: Span,
    ) -> Self {
        Self {
            store,
            graph,
            cache,
            audit,
            gate: MirrorGate::new(),
            options: OrchestratorOptions::default(),
            span,
        }
    }

    pub fn with_options(mut self, options: OrchestratorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn store(&self) -> &Arc<dyn PrimaryStore> {
        &self.store
    }

    pub fn graph(&self) -> &Arc<dyn GraphIndex> {
        &self.graph
    }

    pub fn audit(&self) -> &Arc<AuditService> {
        &self.audit
    }

    /// Hand this to any [`MirrorWorker`](crate::mirror::MirrorWorker) draining into the same graph.
    pub fn gate(&self) -> &MirrorGate {
        &self.gate
    }

    /// Issue the four counts concurrently; any failure fails the whole call.
    pub async fn dashboard_stats(&self) -> Result<DashboardStats> {
        self.traced("dashboard_stats", async {
            let (total_cis, total_ci_types, total_relationships, total_users) = tokio::try_join!(
                self.store.count_cis(),
                self.store.count_ci_types(),
                self.store.count_relationships(),
                self.store.count_users(),
            )?;
            Ok(DashboardStats {
                total_cis,
                total_ci_types,
                total_relationships,
                total_users,
            })
        })
        .await
    }

    /// Hit and miss counters of the CI cache.
    pub async fn cache_stats(&self) -> Result<CacheStats> {
        Ok(self.cache.stats().await?)
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.traced(
            "reconcile",
            reconcile::reconcile(self.store.as_ref(), self.graph.as_ref(), &self.gate),
        )
        .await
    }

    // ── Helpers ───────────────────────────────────────────────────

    async fn traced<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let span = tracing::info_span!(parent: &self.span, "cmdb", op);
        fut.instrument(span).await
    }

    /// Run a secondary-store call under the store timeout, flattening errors to text.
    async fn bounded<T, E, F>(&self, fut: F) -> std::result::Result<T, String>
    where
        E: Display,
        F: Future<Output = std::result::Result<T, E>>,
    {
        match tokio::time::timeout(self.options.store_timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "timed out after {}ms",
                self.options.store_timeout.as_millis()
            )),
        }
    }

    /// Apply the committed write to the graph now; leave it queued on failure
    /// or while a rebuild is running.
    async fn mirror<T>(&self, committed: &Committed<T>) {
        let op = committed.op;
        let Some(_gate) = self.gate.try_shared() else {
            tracing::debug!(
                outbox_id = %committed.outbox_id,
                op = op.kind(),
                "Graph rebuild in progress; left queued"
            );
            return;
        };
        let attempt = self
            .bounded(mirror::apply(self.store.as_ref(), self.graph.as_ref(), op))
            .await;

        match attempt {
            Ok(()) => {
                if let Err(e) = self.store.ack_outbox(committed.outbox_id).await {
                    tracing::warn!(outbox_id = %committed.outbox_id, error = %e, "Failed to acknowledge outbox entry");
                }
            }
            Err(e) => {
                tracing::error!(
                    outbox_id = %committed.outbox_id,
                    op = op.kind(),
                    entity_id = %op.entity_id(),
                    error = %e,
                    "Graph mirror failed; left queued for retry"
                );
                if let Err(e) = mirror::record_failure(
                    self.store.as_ref(),
                    &self.options.retry,
                    committed.outbox_id,
                    op,
                    0,
                    &e,
                )
                .await
                {
                    tracing::error!(outbox_id = %committed.outbox_id, error = %e, "Failed to reschedule outbox entry");
                }
            }
        }
    }

    async fn invalidate_ci(&self, id: CiId) {
        if let Err(e) = self.bounded(self.cache.delete(&ci_key(id))).await {
            tracing::error!(ci_id = %id, error = %e, "Cache invalidation failed");
        }
    }

    async fn record_audit(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
        action: AuditAction,
        ctx: &RequestContext,
        details: serde_json::Value,
    ) {
        if let Err(e) = self
            .audit
            .record(entity_type, Some(entity_id), action, ctx, details)
            .await
        {
            tracing::error!(
                entity_type = %entity_type,
                entity_id = %entity_id,
                action = %action,
                error = %e,
                "Failed to record audit entry"
            );
        }
    }
}

fn required_text(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CmdbError::ValidationFailed(vec![ValidationError::new(
            field,
            "required field is missing",
        )]));
    }
    Ok(())
}

fn validation_result(errors: Vec<ValidationError>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(CmdbError::ValidationFailed(errors))
    }
}
