//! Graph mirroring: applying outbox entries to the Graph Index.
//!
//! Every mirror operation re-reads the Primary Store before touching the
//! graph. An upsert of something already deleted becomes a delete, so
//! replaying an entry is idempotent and the order entries are drained in
//! does not matter.
//!
//! Mirror applications and whole-graph rebuilds are ordered by a
//! [`MirrorGate`]. A rebuild replaces the graph with what it read from the
//! store, so an entry applied and acknowledged between that read and the
//! rebuild would otherwise be lost.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::time::{interval, MissedTickBehavior};

use cmdb_core::config::MirrorConfig;
use cmdb_core::Result;
use cmdb_graph::{GraphEdge, GraphIndex, GraphNode};

use crate::store::{MirrorOp, OutboxId, PrimaryStore};

/// Bring the graph in line with the Primary Store for the entity named by `op`.
pub async fn apply(store: &dyn PrimaryStore, graph: &dyn GraphIndex, op: MirrorOp) -> Result<()> {
    match op {
        MirrorOp::UpsertCi(id) | MirrorOp::DeleteCi(id) => match store.get_ci(id).await? {
            Some(ci) => graph.upsert_node(&GraphNode::from(&ci)).await?,
            None => graph.delete_node(id).await?,
        },
        MirrorOp::UpsertRelationship(id) | MirrorOp::DeleteRelationship(id) => {
            match store.get_relationship(id).await? {
                Some(rel) => graph.upsert_edge(&GraphEdge::from(&rel)).await?,
                None => graph.delete_edge(id).await?,
            }
        }
    }
    Ok(())
}

/// Shared by every mirror application, held exclusively by a rebuild.
#[derive(Debug, Clone, Default)]
pub struct MirrorGate(Arc<RwLock<()>>);

impl MirrorGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.0.read().await
    }

    /// `None` while a rebuild holds the gate.
    pub fn try_shared(&self) -> Option<RwLockReadGuard<'_, ()>> {
        self.0.try_read().ok()
    }

    /// Held from the rebuild's first store read until its acknowledgements are done.
    pub async fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.0.write().await
    }
}

/// Backoff and alerting for failed mirror attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_backoff: Duration,
    pub alert_after_attempts: u32,
}

impl RetryPolicy {
    /// `2^attempts` seconds, capped at `max_backoff`.
    pub fn delay(&self, attempts: u32) -> Duration {
        let secs = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(self.max_backoff)
    }
}

impl From<&MirrorConfig> for RetryPolicy {
    fn from(c: &MirrorConfig) -> Self {
        Self {
            max_backoff: Duration::from_secs(c.max_backoff_secs),
            alert_after_attempts: c.alert_after_attempts,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&MirrorConfig::default())
    }
}

/// Reschedule an outbox entry after a failed attempt.
///
/// `prior_attempts` is the count before this failure.
pub(crate) async fn record_failure(
    store: &dyn PrimaryStore,
    policy: &RetryPolicy,
    id: OutboxId,
    op: MirrorOp,
    prior_attempts: u32,
    error: &str,
) -> Result<()> {
    let attempts = prior_attempts.saturating_add(1);
    let delay = policy.delay(attempts);
    let next = Utc::now()
        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(1));
    store.fail_outbox(id, error.to_string(), next).await?;

    if attempts == policy.alert_after_attempts {
        tracing::error!(
            outbox_id = %id,
            op = op.kind(),
            entity_id = %op.entity_id(),
            attempts,
            error = %error,
            "Persistent divergence between primary store and graph index"
        );
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: usize,
    pub failed: usize,
}

/// Drains the outbox in the background until told to stop.
pub struct MirrorWorker {
    store: Arc<dyn PrimaryStore>,
    graph: Arc<dyn GraphIndex>,
    gate: MirrorGate,
    config: MirrorConfig,
    policy: RetryPolicy,
}

impl MirrorWorker {
    pub fn new(store: Arc<dyn PrimaryStore>, graph: Arc<dyn GraphIndex>, config: MirrorConfig) -> Self {
        let policy = RetryPolicy::from(&config);
        Self {
            store,
            graph,
            gate: MirrorGate::new(),
            config,
            policy,
        }
    }

    /// Share the gate of the orchestrator that runs rebuilds against the same graph.
    pub fn with_gate(mut self, gate: MirrorGate) -> Self {
        self.gate = gate;
        self
    }

    /// One pass over the entries that are due now.
    pub async fn drain_once(&self) -> Result<DrainReport> {
        let _gate = self.gate.shared().await;
        let due = self
            .store
            .pending_outbox(Utc::now(), self.config.batch_size)
            .await?;
        let mut report = DrainReport::default();

        for entry in due {
            match apply(self.store.as_ref(), self.graph.as_ref(), entry.op).await {
                Ok(()) => {
                    self.store.ack_outbox(entry.id).await?;
                    report.applied += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        outbox_id = %entry.id,
                        op = entry.op.kind(),
                        entity_id = %entry.op.entity_id(),
                        attempts = entry.attempts + 1,
                        error = %e,
                        "Graph mirror attempt failed"
                    );
                    record_failure(
                        self.store.as_ref(),
                        &self.policy,
                        entry.id,
                        entry.op,
                        entry.attempts,
                        &e.to_string(),
                    )
                    .await?;
                    report.failed += 1;
                }
            }
        }

        if report.applied + report.failed > 0 {
            tracing::info!(applied = report.applied, failed = report.failed, "Outbox drained");
        }
        Ok(report)
    }

    /// Poll until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            "Mirror worker started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.drain_once().await {
                        tracing::error!(error = %e, "Outbox drain failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Mirror worker stopped");
    }
}
