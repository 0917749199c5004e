use moka::Expiry;
use moka::future::Cache;
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("缓存后端不可用: {0}")]
    Unavailable(String),

    #[error("缓存值序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// 缓存存储后端。值为序列化后的 JSON 文本；每个条目自带 TTL。
pub trait CacheStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, StoreError>> + Send;

    fn set(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone)]
struct Entry {
    body: String,
    ttl: Duration,
}

/// 按条目 TTL 过期（moka 默认只支持整表统一 TTL）。
struct EntryTtl;

impl Expiry<String, Entry> for EntryTtl {
    fn expire_after_create(&self, _key: &String, value: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// 进程内缓存（moka）。
#[derive(Clone)]
pub struct MokaStore {
    cache: Cache<String, Entry>,
}

impl std::fmt::Debug for MokaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaStore")
            .field("max_capacity", &self.cache.policy().max_capacity())
            .field("entry_count", &self.cache.entry_count())
            .finish()
    }
}

impl MokaStore {
    pub fn new(capacity: u64) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(capacity.max(1))
                .expire_after(EntryTtl)
                .build(),
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl CacheStore for MokaStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.cache.get(key).await.map(|e| e.body))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        if ttl.is_zero() {
            return Ok(());
        }
        self.cache
            .insert(key.to_string(), Entry { body: value, ttl })
            .await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "moka"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn moka_store_round_trip_and_miss() {
        let store = MokaStore::new(16);
        assert_eq!(store.get("k").await.unwrap(), None);
        store
            .set("k", "\"v\"".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("\"v\""));
        store.cache.run_pending_tasks().await;
        assert_eq!(store.entry_count(), 1);
    }

    #[tokio::test]
    async fn moka_store_honours_per_entry_ttl() {
        let store = MokaStore::new(16);
        store
            .set("short", "1".to_string(), Duration::from_millis(50))
            .await
            .unwrap();
        store
            .set("long", "2".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.get("short").await.unwrap(), None);
        assert!(store.get("long").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn zero_ttl_is_not_stored() {
        let store = MokaStore::new(16);
        store.set("k", "1".to_string(), Duration::ZERO).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
