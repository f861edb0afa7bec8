//! L1/L2 tiered cache with stale-while-revalidate.
//!
//! # 조회 흐름
//!
//! ```text
//! get(key)
//!    │
//!    ├─ L1 hit (사용 가능) ──────────────────────┐
//!    │                                            │
//!    ├─ L2 hit (사용 가능) ── L1 승격 ────────────┤
//!    │                                            ▼
//!    └─ miss                        fresh → 그대로 반환
//!                                   stale → 반환 + 백그라운드 갱신 1회
//! ```
//!
//! 저장소/직렬화 에러는 호출자에게 전달되지 않습니다. 조회는 miss로,
//! 저장은 경고 로그로 처리됩니다.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use feed_core::{CacheConfig, FeedResult, ProviderKey, SharedClock};
use feed_store::SharedStore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::entry::{CacheEntry, CacheLookup, Freshness};
use crate::error::CacheResult;
use crate::local::LocalCache;
use crate::refresh::{cooldown_key, RefreshLock, RefreshRegistry};
use crate::shared::SharedCache;

/// Cache 통계.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub fresh_hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub refreshes_started: u64,
    pub refreshes_failed: u64,
}

impl CacheStats {
    /// 적중률 (fresh + stale). 조회가 없으면 0.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.fresh_hits + self.stale_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct StatsCounters {
    fresh_hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    refreshes_started: AtomicU64,
    refreshes_failed: AtomicU64,
}

struct Inner {
    local: LocalCache,
    shared: SharedCache,
    store: SharedStore,
    clock: SharedClock,
    config: CacheConfig,
    refresh: RefreshRegistry,
    stats: StatsCounters,
}

/// 2단계 SWR cache.
///
/// 내부 상태를 `Arc`로 공유하므로 clone 비용이 작습니다.
#[derive(Clone)]
pub struct TieredCache {
    inner: Arc<Inner>,
}

impl TieredCache {
    /// 새 cache 생성.
    pub fn new(store: SharedStore, clock: SharedClock, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                local: LocalCache::new(config.l1_capacity, config.l1_shards),
                shared: SharedCache::new(store.clone()),
                refresh: RefreshRegistry::new(config.max_concurrent_refreshes),
                store,
                clock,
                config,
                stats: StatsCounters::default(),
            }),
        }
    }

    /// 기본 설정.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// 값 조회.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheLookup<T> {
        let now = self.inner.clock.now_ms();
        let stats = &self.inner.stats;

        let Some(entry) = self.lookup_entry(key, now).await else {
            stats.misses.fetch_add(1, Ordering::Relaxed);
            debug!(cache_key = key, "Cache miss");
            return CacheLookup::Miss;
        };

        let value: T = match serde_json::from_value(entry.value.clone()) {
            Ok(value) => value,
            Err(e) => {
                warn!(cache_key = key, error = %e, "Cache entry has unexpected shape, treating as miss");
                stats.misses.fetch_add(1, Ordering::Relaxed);
                return CacheLookup::Miss;
            }
        };

        match entry.freshness(now) {
            Freshness::Fresh => {
                stats.fresh_hits.fetch_add(1, Ordering::Relaxed);
                debug!(cache_key = key, "Cache hit (fresh)");
                CacheLookup::Fresh(value)
            }
            Freshness::Stale => {
                stats.stale_hits.fetch_add(1, Ordering::Relaxed);
                debug!(cache_key = key, "Cache hit (stale)");
                CacheLookup::Stale(value)
            }
            Freshness::Expired => {
                stats.misses.fetch_add(1, Ordering::Relaxed);
                CacheLookup::Miss
            }
        }
    }

    /// L1 → L2 순서로 사용 가능한 항목을 찾습니다.
    ///
    /// L1 항목이 stale이면 다른 인스턴스가 이미 갱신했을 수 있으므로 L2를 한 번 더
    /// 확인하고, 더 최신 항목이 있으면 L1으로 승격합니다.
    async fn lookup_entry(&self, key: &str, now: i64) -> Option<CacheEntry> {
        let inner = &self.inner;

        if let Some(entry) = inner.local.get(key) {
            match entry.freshness(now) {
                Freshness::Fresh => return Some(entry),
                Freshness::Stale => {
                    return match self.read_shared(key, now).await {
                        Some(shared) if shared.fresh_until > entry.fresh_until => {
                            debug!(cache_key = key, "Newer L2 entry found, promoting");
                            inner.local.insert(shared.clone());
                            Some(shared)
                        }
                        _ => Some(entry),
                    };
                }
                Freshness::Expired => {
                    inner.local.remove(key);
                }
            }
        }

        let entry = self.read_shared(key, now).await?;
        inner.local.insert(entry.clone());
        Some(entry)
    }

    /// 사용 가능한 L2 항목. 저장소 에러는 miss로 처리합니다.
    async fn read_shared(&self, key: &str, now: i64) -> Option<CacheEntry> {
        match self.inner.shared.get(key).await {
            Ok(Some(entry)) if entry.freshness(now) != Freshness::Expired => Some(entry),
            Ok(_) => None,
            Err(e) => {
                warn!(cache_key = key, error = %e, "L2 lookup failed, treating as miss");
                None
            }
        }
    }

    /// 값 저장 (양쪽 계층). 실패는 로그만 남깁니다.
    ///
    /// 값은 호출 시점에 직렬화되므로 반환된 future는 `value`를 빌리지 않습니다.
    pub fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        fresh_ttl: Duration,
        stale_ttl: Duration,
    ) -> impl Future<Output = ()> + '_ {
        let stored = self.try_set(key, value, fresh_ttl, stale_ttl);
        let key = key.to_string();
        async move {
            if let Err(e) = stored.await {
                warn!(cache_key = %key, error = %e, "Cache write failed");
            }
        }
    }

    /// 값 저장. L1은 항상 갱신되고 L2 실패만 에러로 반환됩니다.
    pub fn try_set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        fresh_ttl: Duration,
        stale_ttl: Duration,
    ) -> impl Future<Output = CacheResult<()>> + '_ {
        let now = self.inner.clock.now_ms();
        let prepared = serde_json::to_value(value)
            .map(|json| CacheEntry::new(key, json, now, fresh_ttl, stale_ttl));
        async move {
            let entry = prepared?;
            self.inner.local.insert(entry.clone());
            self.inner.shared.set(&entry, now).await
        }
    }

    /// 키 무효화. 진행 중인 갱신도 취소합니다.
    pub async fn invalidate(&self, key: &str) -> bool {
        let inner = &self.inner;
        let cancelled = inner.refresh.cancel(key);
        let local = inner.local.remove(key);
        let shared = match inner.shared.delete(key).await {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!(cache_key = key, error = %e, "L2 invalidation failed");
                false
            }
        };
        debug!(cache_key = key, cancelled, "Cache key invalidated");
        local || shared
    }

    /// namespace(`{ns}:` prefix) 전체 삭제. 삭제된 키 수를 반환합니다.
    pub async fn clear_namespace(&self, namespace: &str) -> usize {
        let inner = &self.inner;
        let prefix = format!("{}:", namespace);

        let cancelled = inner.refresh.cancel_prefix(&prefix);
        let local = inner.local.remove_prefix(&prefix);
        let shared = match inner.shared.delete_prefix(&prefix).await {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!(namespace, error = %e, "L2 namespace clear failed");
                0
            }
        };
        debug!(namespace, local, shared, cancelled, "Cache namespace cleared");
        local.max(shared)
    }

    /// 조회 후 stale이면 기본 설정으로 백그라운드 갱신을 예약합니다.
    pub async fn get_or_refresh<T, F, Fut>(
        &self,
        provider: &ProviderKey,
        key: &str,
        fetch: F,
    ) -> CacheLookup<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FeedResult<T>> + Send + 'static,
    {
        let lookup = self.get::<T>(key).await;
        if lookup.is_stale() {
            let config = self.inner.config.clone();
            self.spawn_refresh(provider, key, &config, fetch);
        }
        lookup
    }

    /// 백그라운드 갱신 예약. 실제로 시작했으면 `true`.
    ///
    /// 갱신은 `refresh_timeout` 안에 끝나야 하며, 실패하거나 타임아웃되면 stale 항목을
    /// 그대로 두고 `error_retry_delay` 동안 같은 키의 갱신을 막습니다.
    pub fn spawn_refresh<T, F, Fut>(
        &self,
        provider: &ProviderKey,
        key: &str,
        config: &CacheConfig,
        fetch: F,
    ) -> bool
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FeedResult<T>> + Send + 'static,
    {
        let cache = self.clone();
        let provider_key = provider.clone();
        let cache_key = key.to_string();
        let config = config.clone();

        let task = async move {
            cache
                .run_refresh(&provider_key, &cache_key, &config, fetch)
                .await;
        };

        let started = self.inner.refresh.spawn(provider, key, task);
        if started {
            self.inner
                .stats
                .refreshes_started
                .fetch_add(1, Ordering::Relaxed);
            debug!(provider = %provider, cache_key = key, "Background refresh scheduled");
        }
        started
    }

    async fn run_refresh<T, F, Fut>(
        &self,
        provider: &ProviderKey,
        key: &str,
        config: &CacheConfig,
        fetch: F,
    ) where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = FeedResult<T>>,
    {
        let store = &self.inner.store;

        match store.get(&cooldown_key(key)).await {
            Ok(Some(_)) => {
                debug!(provider = %provider, cache_key = key, "Refresh in cooldown, skipping");
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(cache_key = key, error = %e, "Cooldown check failed");
            }
        }

        let lock = match RefreshLock::acquire(store, key, config.refresh_timeout()).await {
            Ok(Some(lock)) => Some(lock),
            Ok(None) => {
                debug!(provider = %provider, cache_key = key, "Refresh already running elsewhere");
                return;
            }
            Err(e) => {
                warn!(
                    cache_key = key,
                    error = %e,
                    "Refresh lock unavailable, relying on local dedup"
                );
                None
            }
        };

        // 다른 인스턴스가 lock을 잡기 전에 이미 갱신을 마쳤으면 provider를 다시 호출하지 않음
        let now = self.inner.clock.now_ms();
        if let Some(entry) = self.read_shared(key, now).await {
            if entry.freshness(now) == Freshness::Fresh {
                debug!(provider = %provider, cache_key = key, "Key already refreshed, skipping fetch");
                self.inner.local.insert(entry);
                if let Some(lock) = lock {
                    lock.release().await;
                }
                return;
            }
        }

        let failure = match tokio::time::timeout(config.refresh_timeout(), fetch()).await {
            Ok(Ok(value)) => {
                let stored = self.try_set(key, &value, config.fresh_ttl(), config.stale_ttl());
                match stored.await {
                    Ok(()) => debug!(provider = %provider, cache_key = key, "Background refresh completed"),
                    Err(e) => warn!(cache_key = key, error = %e, "Refreshed value not stored in L2"),
                }
                None
            }
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("timed out after {:?}", config.refresh_timeout())),
        };

        if let Some(reason) = failure {
            self.inner
                .stats
                .refreshes_failed
                .fetch_add(1, Ordering::Relaxed);
            warn!(
                provider = %provider,
                cache_key = key,
                error = %reason,
                "Background refresh failed, keeping stale value"
            );
            self.set_cooldown(key, config.error_retry_delay()).await;
        }

        if let Some(lock) = lock {
            lock.release().await;
        }
    }

    async fn set_cooldown(&self, key: &str, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        if let Err(e) = self.inner.store.set(&cooldown_key(key), "1", delay).await {
            warn!(cache_key = key, error = %e, "Failed to set refresh cooldown");
        }
    }

    /// 누적 통계.
    pub fn stats(&self) -> CacheStats {
        let s = &self.inner.stats;
        CacheStats {
            fresh_hits: s.fresh_hits.load(Ordering::Relaxed),
            stale_hits: s.stale_hits.load(Ordering::Relaxed),
            misses: s.misses.load(Ordering::Relaxed),
            refreshes_started: s.refreshes_started.load(Ordering::Relaxed),
            refreshes_failed: s.refreshes_failed.load(Ordering::Relaxed),
        }
    }

    /// 실행 중인 백그라운드 갱신 수.
    pub fn refreshes_in_flight(&self) -> usize {
        self.inner.refresh.in_flight()
    }

    /// 해당 키의 갱신 실행 여부.
    pub fn is_refreshing(&self, provider: &ProviderKey, key: &str) -> bool {
        self.inner.refresh.is_refreshing(provider, key)
    }

    /// L1 항목 수.
    pub fn local_len(&self) -> usize {
        self.inner.local.len()
    }
}
