//! Read-through cache for individual CIs.
//!
//! The cache holds serialized bytes only; callers own the encoding. Entries
//! carry no version, so a stale value may survive until its TTL expires.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use cmdb_core::{CiId, CmdbError};

pub use memory::MemoryCache;
pub use redis::RedisCache;

/// Errors that can occur during cache operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("Cache connection failed: {0}")]
    Connection(String),

    #[error("Cache command failed: {0}")]
    Command(String),

    #[error("Cache operation timed out")]
    Timeout,
}

impl From<CacheError> for CmdbError {
    fn from(e: CacheError) -> Self {
        CmdbError::Internal(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Live entries, when the backend can tell cheaply.
    pub size: Option<u64>,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;

    /// Returns whether an entry was removed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    async fn stats(&self) -> Result<CacheStats, CacheError>;
}

/// Cache key for a CI: `ci:<id>`.
pub fn ci_key(id: CiId) -> String {
    format!("ci:{id}")
}
