use crate::cache::key::CacheKey;
use crate::cache::store::{CacheStore, MokaStore, StoreError};
use crate::util::clock::Clock;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 可以进入结果缓存的值。
///
/// 空结果（null、空集合、空字符串）不会被缓存；默认实现按序列化后的 JSON 判断，
/// 业务类型可以覆盖为自己的"空"定义。
pub trait CacheValue: Serialize + DeserializeOwned + Send {
    fn is_empty_result(&self) -> bool {
        match serde_json::to_value(self) {
            Ok(v) => json_is_empty(&v),
            Err(_) => true,
        }
    }
}

fn json_is_empty(v: &serde_json::Value) -> bool {
    use serde_json::Value;
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

impl CacheValue for String {}
impl CacheValue for serde_json::Value {}
impl<T: Serialize + DeserializeOwned + Send> CacheValue for Vec<T> {}
impl<T: Serialize + DeserializeOwned + Send> CacheValue for Option<T> {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    pub enabled: bool,
    pub ttl: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub value: T,
    pub from_cache: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub backend: String,
    pub enabled: bool,
    pub degraded: bool,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub hits: u64,
    pub misses: u64,
    pub stored: u64,
    pub skipped_empty: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stored: AtomicU64,
    skipped_empty: AtomicU64,
}

/// 幂等调用的结果缓存。
///
/// 只是辅助层：后端出错时放弃缓存、照常执行计算（fail open），
/// 同时把 `degraded` 置位，直到后端再次成功。
#[derive(Debug)]
pub struct ResultCache<S: CacheStore = MokaStore> {
    store: S,
    settings: ArcSwap<CacheSettings>,
    degraded: AtomicBool,
    last_error: Mutex<Option<(String, DateTime<Utc>)>>,
    counters: Counters,
    clock: Arc<dyn Clock>,
}

impl ResultCache<MokaStore> {
    pub fn in_memory(capacity: u64, settings: CacheSettings, clock: Arc<dyn Clock>) -> Self {
        Self::new(MokaStore::new(capacity), settings, clock)
    }
}

impl<S: CacheStore> ResultCache<S> {
    pub fn new(store: S, settings: CacheSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            settings: ArcSwap::from_pointee(settings),
            degraded: AtomicBool::new(false),
            last_error: Mutex::new(None),
            counters: Counters::default(),
            clock,
        }
    }

    pub fn settings(&self) -> CacheSettings {
        **self.settings.load()
    }

    pub fn update_settings(&self, settings: CacheSettings) {
        self.settings.store(Arc::new(settings));
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// 命中则直接返回；未命中则执行 `compute`。
    ///
    /// - `compute` 出错：原样返回错误，不缓存
    /// - 结果为空：返回结果，不缓存
    /// - 其余结果按 `ttl` 写入
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: F,
    ) -> Result<Cached<T>, E>
    where
        T: CacheValue,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.settings().enabled {
            return compute().await.map(|value| Cached {
                value,
                from_cache: false,
            });
        }

        match self.store.get(key.as_str()).await {
            Ok(Some(body)) => {
                self.mark_healthy();
                match serde_json::from_str::<T>(&body) {
                    Ok(value) => {
                        self.counters.hits.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(key = %key, "结果缓存命中");
                        return Ok(Cached {
                            value,
                            from_cache: true,
                        });
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "缓存条目无法解析，按未命中处理");
                    }
                }
            }
            Ok(None) => self.mark_healthy(),
            Err(e) => self.mark_degraded(&e),
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let value = compute().await?;

        if value.is_empty_result() {
            self.counters.skipped_empty.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %key, "空结果不写入缓存");
            return Ok(Cached {
                value,
                from_cache: false,
            });
        }

        let stored = match serde_json::to_string(&value) {
            Ok(body) => self.store.set(key.as_str(), body, ttl).await,
            Err(e) => Err(StoreError::from(e)),
        };
        match stored {
            Ok(()) => {
                self.mark_healthy();
                self.counters.stored.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => self.mark_degraded(&e),
        }

        Ok(Cached {
            value,
            from_cache: false,
        })
    }

    fn mark_degraded(&self, e: &StoreError) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            tracing::warn!(backend = self.store.name(), error = %e, "缓存后端异常，进入降级模式（跳过缓存）");
        }
        let mut last = self.last_error.lock().unwrap_or_else(|p| p.into_inner());
        *last = Some((e.to_string(), self.clock.now()));
    }

    fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::AcqRel) {
            tracing::info!(backend = self.store.name(), "缓存后端恢复，退出降级模式");
        }
    }

    pub fn stats(&self) -> CacheStats {
        let last = self
            .last_error
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        CacheStats {
            backend: self.store.name().to_string(),
            enabled: self.settings().enabled,
            degraded: self.is_degraded(),
            last_error: last.as_ref().map(|(m, _)| m.clone()),
            last_error_at: last.map(|(_, at)| at),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stored: self.counters.stored.load(Ordering::Relaxed),
            skipped_empty: self.counters.skipped_empty.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::clock::ManualClock;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;

    fn cache() -> ResultCache {
        ResultCache::in_memory(64, CacheSettings::default(), Arc::new(ManualClock::at_epoch_boundary()))
    }

    fn key(op: &str) -> CacheKey {
        CacheKey::new(op, &serde_json::json!({"ticker": "AAPL"})).unwrap()
    }

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn hit_skips_compute() {
        let cache = cache();
        let calls = &AtomicUsize::new(0);
        let compute = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(vec!["a".to_string()])
        };

        let first = cache.get_or_compute(&key("q"), TTL, compute).await.unwrap();
        assert!(!first.from_cache);
        let second = cache.get_or_compute(&key("q"), TTL, compute).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(second.value, vec!["a".to_string()]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn empty_results_are_never_cached() {
        let cache = cache();
        let calls = &AtomicUsize::new(0);
        for _ in 0..2 {
            let out = cache
                .get_or_compute(&key("empty"), TTL, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<Vec<String>, String>(Vec::new())
                })
                .await
                .unwrap();
            assert!(!out.from_cache);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let none = cache
            .get_or_compute(&key("none"), TTL, || async { Ok::<Option<u32>, String>(None) })
            .await
            .unwrap();
        assert_eq!(none.value, None);
        assert_eq!(cache.stats().skipped_empty, 3);
        assert_eq!(cache.stats().stored, 0);
    }

    #[tokio::test]
    async fn errors_propagate_and_are_not_cached() {
        let cache = cache();
        let err = cache
            .get_or_compute(&key("err"), TTL, || async { Err::<String, _>("boom") })
            .await
            .unwrap_err();
        assert_eq!(err, "boom");

        let ok = cache
            .get_or_compute(&key("err"), TTL, || async { Ok::<_, &str>("fine".to_string()) })
            .await
            .unwrap();
        assert!(!ok.from_cache);
        assert_eq!(ok.value, "fine");
    }

    #[tokio::test]
    async fn disabled_cache_always_computes() {
        let cache = ResultCache::in_memory(
            64,
            CacheSettings {
                enabled: false,
                ttl: TTL,
            },
            Arc::new(ManualClock::at_epoch_boundary()),
        );
        let calls = &AtomicUsize::new(0);
        for _ in 0..3 {
            cache
                .get_or_compute(&key("off"), TTL, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>("x".to_string())
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[derive(Debug, Default)]
    struct FlakyStore {
        down: AtomicBool,
    }

    impl CacheStore for FlakyStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection refused".into()));
            }
            Ok(None)
        }

        async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection refused".into()));
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn failing_backend_fails_open_and_reports_degraded() {
        let failed_at = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        let cache = ResultCache::new(
            FlakyStore::default(),
            CacheSettings::default(),
            Arc::new(ManualClock::at(failed_at)),
        );
        cache.store.down.store(true, Ordering::SeqCst);

        let out = cache
            .get_or_compute(&key("x"), TTL, || async { Ok::<_, String>("live".to_string()) })
            .await
            .unwrap();
        assert_eq!(out.value, "live");
        assert!(cache.is_degraded());
        let stats = cache.stats();
        assert!(stats.degraded);
        assert!(stats.last_error.unwrap().contains("connection refused"));
        assert_eq!(stats.last_error_at, Some(failed_at));

        cache.store.down.store(false, Ordering::SeqCst);
        cache
            .get_or_compute(&key("x"), TTL, || async { Ok::<_, String>("live".to_string()) })
            .await
            .unwrap();
        assert!(!cache.is_degraded());
    }
}
