//! Redis-backed cache using a `deadpool-redis` connection pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis::{cmd, AsyncCommands};
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};

use cmdb_core::config::{CacheConfig, RedisSettings};

use super::{Cache, CacheError, CacheStats};

/// Keys are stored as `{key_prefix}{key}`, so with the default empty prefix
/// a CI lives under `ci:<id>`.
pub struct RedisCache {
    pool: Pool,
    key_prefix: String,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RedisCache {
    /// Build the pool and check the server answers `PING`.
    pub async fn connect(redis: &RedisSettings, cache: &CacheConfig) -> Result<Self, CacheError> {
        let pool = PoolConfig::from_url(&redis.url)
            .builder()
            .map_err(|e| CacheError::Connection(format!("invalid pool config: {e}")))?
            .max_size(redis.pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| CacheError::Connection(format!("failed to build pool: {e}")))?;

        let this = Self {
            pool,
            key_prefix: cache.key_prefix.clone(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        };

        let mut conn = this.conn().await?;
        cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| CacheError::Connection(format!("PING failed: {e}")))?;

        tracing::info!(url = %redis.url, pool_size = redis.pool_size, "Connected to Redis");
        Ok(this)
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, CacheError> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::Connection(format!("failed to get connection: {e}")))
    }
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn().await?;
        let value: Option<Vec<u8>> = conn
            .get(self.full_key(key))
            .await
            .map_err(|e| CacheError::Command(format!("GET failed: {e}")))?;

        let counter = if value.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        let full_key = self.full_key(key);
        if ttl.is_zero() {
            let _: () = conn
                .set(&full_key, value)
                .await
                .map_err(|e| CacheError::Command(format!("SET failed: {e}")))?;
        } else {
            let _: () = conn
                .set_ex(&full_key, value, ttl.as_secs().max(1))
                .await
                .map_err(|e| CacheError::Command(format!("SET EX failed: {e}")))?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn
            .del(self.full_key(key))
            .await
            .map_err(|e| CacheError::Command(format!("DEL failed: {e}")))?;
        Ok(removed > 0)
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: None,
        })
    }
}
