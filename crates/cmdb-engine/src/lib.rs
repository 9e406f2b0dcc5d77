//! CMDB Engine: keeps the primary store, graph index, cache and audit trail coherent.
//!
//! The [`Orchestrator`] is the single entry point for mutations. It commits
//! to the [`PrimaryStore`] first and then brings the derived stores in
//! line; the [`MirrorWorker`] replays whatever the graph missed.

pub mod app;
pub mod cache;
pub mod mirror;
pub mod orchestrator;
pub mod reconcile;
pub mod store;

pub use app::Engine;
pub use cache::{Cache, CacheError, CacheStats, MemoryCache, RedisCache};
pub use mirror::{DrainReport, MirrorGate, MirrorWorker, RetryPolicy};
pub use orchestrator::{Orchestrator, OrchestratorOptions};
pub use reconcile::ReconcileReport;
pub use store::{MemoryStore, MirrorOp, OutboxEntry, PrimaryStore, SqliteStore, User};
