//! In-process cache with per-entry expiry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};

use super::{Cache, CacheError, CacheStats};

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    data: RwLock<HashMap<String, Entry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut data = self.data.write().await;
        let before = data.len();
        data.retain(|_, e| !e.is_expired(now));
        before - data.len()
    }

    /// Purge every `every` until the cache is dropped or the handle aborted.
    pub fn spawn_janitor(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = interval_at(tokio::time::Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(live) = cache.upgrade() else {
                    break;
                };
                let purged = live.purge_expired().await;
                if purged > 0 {
                    tracing::debug!(purged, "Purged expired cache entries");
                }
            }
        })
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = Instant::now();
        let found = {
            let data = self.data.read().await;
            data.get(key)
                .filter(|e| !e.is_expired(now))
                .map(|e| e.value.clone())
        };

        match found {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(value))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// A zero TTL stores the entry without expiry.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        self.data.write().await.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.data.write().await.remove(key).is_some())
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        let now = Instant::now();
        let size = self
            .data
            .read()
            .await
            .values()
            .filter(|e| !e.is_expired(now))
            .count() as u64;
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: Some(size),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete() {
        let cache = MemoryCache::new();
        cache.set("ci:1", b"payload", Duration::from_secs(300)).await.unwrap();

        assert_eq!(cache.get("ci:1").await.unwrap(), Some(b"payload".to_vec()));
        assert_eq!(cache.get("ci:2").await.unwrap(), None);
        assert!(cache.delete("ci:1").await.unwrap());
        assert!(!cache.delete("ci:1").await.unwrap());

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, Some(0));
    }

    #[tokio::test]
    async fn entries_expire() {
        let cache = MemoryCache::new();
        cache.set("short", b"x", Duration::from_millis(20)).await.unwrap();
        cache.set("forever", b"y", Duration::ZERO).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("short").await.unwrap(), None);
        assert_eq!(cache.get("forever").await.unwrap(), Some(b"y".to_vec()));
        assert_eq!(cache.purge_expired().await, 1);
    }

    #[tokio::test]
    async fn janitor_purges_and_stops_with_the_cache() {
        let cache = Arc::new(MemoryCache::new());
        cache.set("short", b"x", Duration::from_millis(10)).await.unwrap();
        cache.set("forever", b"y", Duration::ZERO).await.unwrap();

        let janitor = cache.spawn_janitor(Duration::from_millis(25));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.data.read().await.len(), 1);

        drop(cache);
        tokio::time::timeout(Duration::from_secs(1), janitor)
            .await
            .expect("janitor exits once the cache is gone")
            .unwrap();
    }
}
