//! Configuration management for CMDB services.
//!
//! Configuration is loaded from (in priority order):
//! 1. Environment variables (`CMDB_` prefix, `__` between sections, e.g. `CMDB_NEO4J__URI`)
//! 2. Config file (`cmdb.toml` or the prefix given on the command line)
//! 3. Defaults

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

pub const ENV_PREFIX: &str = "CMDB";
pub const DEFAULT_FILE_PREFIX: &str = "cmdb";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CmdbConfig {
    pub store: StoreConfig,
    pub graph: GraphSection,
    pub neo4j: Neo4jSettings,
    pub cache: CacheConfig,
    pub redis: RedisSettings,
    pub audit: AuditConfig,
    pub mirror: MirrorConfig,
    pub orchestrator: OrchestratorSettings,
    pub logging: LoggingConfig,
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl CmdbConfig {
    /// Load from `{file_prefix}.{toml,json,yaml,...}` (optional) overlaid with environment variables.
    pub fn load(file_prefix: &str) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name(file_prefix).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut loaded: CmdbConfig = cfg.try_deserialize()?;
        if loaded.environment.is_empty() {
            loaded.environment = default_environment();
        }
        Ok(loaded)
    }
}

/// Primary store settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite URL, e.g. `sqlite://cmdb.db` or `sqlite::memory:`.
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl StoreConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://cmdb.db".to_string(),
            max_connections: 5,
            acquire_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GraphBackend {
    #[default]
    Memory,
    Neo4j,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GraphSection {
    pub backend: GraphBackend,
}

/// Connection settings for the Neo4j graph index.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Neo4jSettings {
    pub uri: String,
    pub user: String,
    pub password: String,
    pub database: Option<String>,
    pub max_connections: u32,
    pub fetch_size: usize,
}

impl Default for Neo4jSettings {
    fn default() -> Self {
        Self {
            uri: "bolt://localhost:7687".to_string(),
            user: "neo4j".to_string(),
            password: "cmdb-dev".to_string(),
            database: None,
            max_connections: 50,
            fetch_size: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    /// Lifetime of a cached CI.
    pub ttl_secs: u64,
    /// Prepended to every cache key, e.g. `"cmdb:"` gives `cmdb:ci:<id>`.
    pub key_prefix: String,
    /// How often the in-process cache drops expired entries. Zero disables it.
    pub purge_interval_secs: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            ttl_secs: 300,
            key_prefix: String::new(),
            purge_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub url: String,
    pub pool_size: usize,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Directory for the file-backed audit store. `None` keeps entries in memory.
    pub dir: Option<PathBuf>,
    pub retention_days: i64,
    pub export_limit: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            dir: None,
            retention_days: 365,
            export_limit: 10_000,
        }
    }
}

/// Outbox drain settings for the graph mirror worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub max_backoff_secs: u64,
    /// Attempts after which a stuck entry is reported as persistent divergence.
    pub alert_after_attempts: u32,
}

impl MirrorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            batch_size: 100,
            max_backoff_secs: 300,
            alert_after_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Deadline for each secondary-store call (graph mirror, cache) on the write path.
    pub store_timeout_ms: u64,
}

impl OrchestratorSettings {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            store_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

fn default_environment() -> String {
    "development".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = CmdbConfig::default();
        assert_eq!(cfg.cache.ttl(), Duration::from_secs(300));
        assert_eq!(cfg.redis.pool_size, 10);
        assert_eq!(cfg.audit.retention_days, 365);
        assert_eq!(cfg.audit.export_limit, 10_000);
        assert_eq!(cfg.graph.backend, GraphBackend::Memory);
        assert_eq!(cfg.neo4j.uri, "bolt://localhost:7687");
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.store.database_url, "sqlite://cmdb.db");
        assert_eq!(cfg.store.max_connections, 5);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = CmdbConfig::load("definitely-not-a-config-file").unwrap();
        assert_eq!(cfg.mirror.batch_size, 100);
        assert_eq!(cfg.environment, "development");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg: CmdbConfig = serde_json::from_str(
            r#"{"cache": {"backend": "redis"}, "graph": {"backend": "neo4j"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.cache.backend, CacheBackend::Redis);
        assert_eq!(cfg.cache.ttl_secs, 300);
        assert_eq!(cfg.cache.purge_interval_secs, 60);
        assert_eq!(cfg.graph.backend, GraphBackend::Neo4j);
    }
}
