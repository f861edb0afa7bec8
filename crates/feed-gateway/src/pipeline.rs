//! Resilience pipeline.
//!
//! provider 호출 한 번은 다음 순서를 거칩니다:
//!
//! ```text
//! cache.get(key)
//!   ├─ fresh → 반환
//!   ├─ stale → 반환 + 백그라운드 갱신 (아래 체인을 그대로 사용)
//!   └─ miss  → rate limiter → circuit breaker(retry(fetch)) → cache.set
//! ```
//!
//! `RateLimited`/`CircuitOpen`은 네트워크 호출 전에 발생하며 재시도 엔진을
//! 거치지 않고 각자의 `retry_after`와 함께 호출자에게 전달됩니다.

use std::future::Future;
use std::sync::Arc;

use feed_cache::{CacheLookup, TieredCache};
use feed_core::{
    BreakerConfig, CacheConfig, FeedError, FeedResult, GatewayConfig, LimiterConfig, ProviderKey,
    ProviderPolicy, RetryConfig, SharedClock, SystemClock,
};
use feed_resilience::{default_classify, CircuitBreaker, ErrorClass, RateLimiter, RetryPolicy};
use feed_store::{connect_store, SharedStore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::metrics::{MetricsRegistry, ProviderMetrics};
use crate::registry::ProviderRegistry;

/// 호출별 정책 오버라이드.
///
/// 지정하지 않은 항목은 provider에 등록된 정책을 따릅니다.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub cache: Option<CacheConfig>,
    pub breaker: Option<BreakerConfig>,
    pub limiter: Option<LimiterConfig>,
    pub retry: Option<RetryConfig>,
    /// cache를 거치지 않고 항상 provider를 호출
    pub skip_cache: bool,
}

impl CallOptions {
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_limiter(mut self, limiter: LimiterConfig) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// cache 우회.
    pub fn skip_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }

    /// 정책 오버라이드가 하나라도 있는지.
    pub fn has_overrides(&self) -> bool {
        self.cache.is_some()
            || self.breaker.is_some()
            || self.limiter.is_some()
            || self.retry.is_some()
    }
}

/// fetch 함수와 에러 분류기 묶음 (백그라운드 갱신과 공유).
struct FetchPlan<F, C> {
    fetch: F,
    classify: C,
}

struct GatewayInner {
    store: SharedStore,
    registry: ProviderRegistry,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    cache: TieredCache,
    metrics: MetricsRegistry,
}

/// provider 호출 gateway.
///
/// 저장소와 시계는 주입되며, 같은 저장소를 공유하는 모든 인스턴스가 circuit/rate limit
/// 상태와 L2 cache를 공유합니다. clone 비용이 작습니다.
///
/// ```ignore
/// let gateway = ResilientGateway::connect(GatewayConfig::from_env()?).await?;
/// let quote: Quote = gateway
///     .call(&yahoo, "quotes:AAPL", move || client.clone().fetch_quote("AAPL"))
///     .await?;
/// ```
#[derive(Clone)]
pub struct ResilientGateway {
    inner: Arc<GatewayInner>,
}

impl ResilientGateway {
    /// 주입된 저장소와 시계로 생성.
    pub fn new(store: SharedStore, clock: SharedClock, config: GatewayConfig) -> FeedResult<Self> {
        config.validate()?;
        let state_ttl = config.store.state_ttl();
        let registry = ProviderRegistry::from_config(&config)?;

        let gateway = Self {
            inner: Arc::new(GatewayInner {
                registry,
                breaker: CircuitBreaker::new(
                    store.clone(),
                    clock.clone(),
                    config.breaker.clone(),
                    state_ttl,
                ),
                limiter: RateLimiter::new(
                    store.clone(),
                    clock.clone(),
                    config.limiter.clone(),
                    state_ttl,
                ),
                cache: TieredCache::new(store.clone(), clock, config.cache.clone()),
                metrics: MetricsRegistry::new(),
                store,
            }),
        };

        for provider in gateway.inner.registry.providers() {
            let policy = gateway.inner.registry.policy_for(&provider);
            gateway.inner.breaker.configure(&provider, policy.breaker)?;
            gateway.inner.limiter.configure(&provider, policy.limiter)?;
        }

        info!(
            backend = ?gateway.inner.store.backend(),
            providers = config.providers.len(),
            "Resilient gateway initialized"
        );
        Ok(gateway)
    }

    /// 설정에 맞는 저장소에 연결해 생성 (시스템 시계 사용).
    pub async fn connect(config: GatewayConfig) -> FeedResult<Self> {
        let clock = SystemClock::shared();
        let store = connect_store(&config.store, clock.clone()).await?;
        Self::new(store, clock, config)
    }

    /// provider 정책 등록 (기존 정책 교체).
    pub fn register_provider(&self, provider: &ProviderKey, policy: ProviderPolicy) -> FeedResult<()> {
        self.inner.registry.validate(&policy)?;
        self.inner.breaker.configure(provider, policy.breaker.clone())?;
        self.inner.limiter.configure(provider, policy.limiter.clone())?;
        self.inner.registry.register(provider, policy)
    }

    /// provider에 적용되는 정책.
    pub fn policy_for(&self, provider: &ProviderKey) -> ProviderPolicy {
        self.inner.registry.policy_for(provider)
    }

    /// 등록된 provider 목록.
    pub fn providers(&self) -> Vec<ProviderKey> {
        self.inner.registry.providers()
    }

    /// 기본 분류기와 등록된 정책으로 호출합니다.
    pub async fn call<T, F, Fut>(&self, provider: &ProviderKey, cache_key: &str, fetch: F) -> FeedResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FeedResult<T>> + Send + 'static,
    {
        self.resilient_call(provider, cache_key, fetch, default_classify, CallOptions::default())
            .await
    }

    /// cache, rate limit, circuit breaker, retry를 거쳐 값을 가져옵니다.
    ///
    /// `classify`는 fetch 에러의 재시도 여부를 결정합니다. circuit 실패 집계는
    /// 분류와 무관하게 provider 장애(`FeedError::is_provider_fault`)만 대상으로 합니다.
    #[instrument(skip_all, fields(provider = %provider, cache_key = cache_key))]
    pub async fn resilient_call<T, F, Fut, C>(
        &self,
        provider: &ProviderKey,
        cache_key: &str,
        fetch: F,
        classify: C,
        options: CallOptions,
    ) -> FeedResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FeedResult<T>> + Send + 'static,
        C: Fn(&FeedError) -> ErrorClass + Send + Sync + 'static,
    {
        let policy = self.inner.registry.effective_policy(provider, &options)?;
        let plan = Arc::new(FetchPlan { fetch, classify });

        if options.skip_cache {
            return self.guarded_fetch(provider, &policy, &plan).await;
        }

        let inner = &self.inner;
        match inner.cache.get::<T>(cache_key).await {
            CacheLookup::Fresh(value) => {
                inner.metrics.record_cache_lookup(provider, true);
                Ok(value)
            }
            CacheLookup::Stale(value) => {
                inner.metrics.record_cache_lookup(provider, true);
                let gateway = self.clone();
                let refresh_provider = provider.clone();
                let refresh_policy = policy.clone();
                inner
                    .cache
                    .spawn_refresh(provider, cache_key, &policy.cache, move || async move {
                        gateway
                            .guarded_fetch(&refresh_provider, &refresh_policy, &plan)
                            .await
                    });
                Ok(value)
            }
            CacheLookup::Miss => {
                inner.metrics.record_cache_lookup(provider, false);
                let value = self.guarded_fetch(provider, &policy, &plan).await?;
                inner
                    .cache
                    .set(
                        cache_key,
                        &value,
                        policy.cache.fresh_ttl(),
                        policy.cache.stale_ttl(),
                    )
                    .await;
                Ok(value)
            }
        }
    }

    /// rate limiter → circuit breaker → retry → fetch.
    async fn guarded_fetch<T, F, Fut, C>(
        &self,
        provider: &ProviderKey,
        policy: &ProviderPolicy,
        plan: &FetchPlan<F, C>,
    ) -> FeedResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = FeedResult<T>>,
        C: Fn(&FeedError) -> ErrorClass,
    {
        let inner = &self.inner;

        let decision = inner.limiter.acquire_with(provider, &policy.limiter, 1).await?;
        if let Err(e) = decision.into_result(provider) {
            inner.metrics.record_rejection(provider, &e);
            return Err(e);
        }

        let retry = RetryPolicy::new(policy.retry.clone());
        let guarded = async {
            let (result, stats) = retry
                .execute_with_hint(
                    || (plan.fetch)(),
                    |e: &FeedError| (plan.classify)(e),
                    FeedError::retry_after,
                )
                .await;
            inner.metrics.record_retry(provider, &result, &stats);
            if stats.retries() > 0 {
                debug!(
                    provider = %provider,
                    attempts = stats.attempts,
                    total_delay_ms = stats.total_delay().as_millis() as u64,
                    "Fetch completed after retries"
                );
            }
            result.map_err(FeedError::from)
        };

        let result = inner
            .breaker
            .execute_with(provider, &policy.breaker, guarded, FeedError::is_provider_fault)
            .await;
        if let Err(e) = &result {
            if matches!(e, FeedError::CircuitOpen { .. }) {
                inner.metrics.record_rejection(provider, e);
            }
        }
        result
    }

    /// provider 메트릭 조회.
    pub async fn get_metrics(&self, provider: &ProviderKey) -> ProviderMetrics {
        let inner = &self.inner;
        let circuit = inner.breaker.snapshot(provider).await;
        let tokens_remaining = inner.limiter.peek(provider).await;
        let counters = inner.metrics.snapshot(provider);

        ProviderMetrics {
            provider: provider.clone(),
            circuit_state: circuit.state,
            failure_count: circuit.failure_count,
            circuit_retry_after: circuit.retry_after,
            tokens_remaining,
            cache_hit_rate: counters.cache_hit_rate(),
            cache_hits: counters.cache_hits,
            cache_misses: counters.cache_misses,
            retry_counts: counters.retry_counts,
            rate_limited: counters.rate_limited,
            circuit_rejections: counters.circuit_rejections,
            circuit: inner.breaker.counters(provider),
        }
    }

    /// cache 키 무효화 (L1, L2, 진행 중인 갱신).
    pub async fn invalidate_cache(&self, cache_key: &str) -> bool {
        self.inner.cache.invalidate(cache_key).await
    }

    /// namespace 전체 무효화. 삭제된 키 수를 반환합니다.
    pub async fn clear_namespace(&self, namespace: &str) -> usize {
        self.inner.cache.clear_namespace(namespace).await
    }

    /// circuit 수동 리셋.
    pub async fn reset_circuit(&self, provider: &ProviderKey) -> FeedResult<()> {
        self.inner.breaker.reset(provider).await
    }

    /// 공유 저장소 상태 확인.
    pub async fn health_check(&self) -> bool {
        self.inner.store.health_check().await.unwrap_or(false)
    }

    /// 내부 cache 핸들.
    pub fn cache(&self) -> &TieredCache {
        &self.inner.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feed_core::ManualClock;
    use feed_store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn gateway() -> (ResilientGateway, Arc<ManualClock>) {
        let clock = ManualClock::starting_at_epoch_2024();
        let store: SharedStore = Arc::new(MemoryStore::new(clock.clone()));
        let mut config = GatewayConfig::default();
        config.retry = RetryConfig::without_jitter(1, Duration::ZERO);
        let gateway = ResilientGateway::new(store, clock.clone(), config).unwrap();
        (gateway, clock)
    }

    #[tokio::test]
    async fn test_miss_then_fresh_hit() {
        let (gateway, _clock) = gateway();
        let yahoo = ProviderKey::new("yahoo").unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let price: f64 = gateway
                .call(&yahoo, "quotes:AAPL", move || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(187.5)
                    }
                })
                .await
                .unwrap();
            assert_eq!(price, 187.5);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let metrics = gateway.get_metrics(&yahoo).await;
        assert_eq!((metrics.cache_hits, metrics.cache_misses), (2, 1));
        assert_eq!(metrics.retry_counts.calls, 1);
    }

    #[tokio::test]
    async fn test_skip_cache_always_fetches() {
        let (gateway, _clock) = gateway();
        let yahoo = ProviderKey::new("yahoo").unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            let _: u32 = gateway
                .resilient_call(
                    &yahoo,
                    "quotes:AAPL",
                    move || {
                        let calls = calls.clone();
                        async move { Ok(calls.fetch_add(1, Ordering::SeqCst)) }
                    },
                    default_classify,
                    CallOptions::default().skip_cache(),
                )
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(gateway.get_metrics(&yahoo).await.cache_misses, 0);
    }

    #[tokio::test]
    async fn test_register_provider_rejects_invalid_policy() {
        let (gateway, _clock) = gateway();
        let fmp = ProviderKey::new("fmp").unwrap();

        let mut policy = ProviderPolicy::default();
        policy.breaker.failure_threshold = 0;
        assert!(matches!(
            gateway.register_provider(&fmp, policy),
            Err(FeedError::Config(_))
        ));
        assert!(gateway.providers().is_empty());
    }

    #[tokio::test]
    async fn test_cache_entries_follow_clock() {
        let (gateway, clock) = gateway();
        let yahoo = ProviderKey::new("yahoo").unwrap();
        let options = CallOptions::default().with_cache(CacheConfig::with_ttls(
            Duration::from_secs(10),
            Duration::from_secs(5),
        ));

        let _: String = gateway
            .resilient_call(
                &yahoo,
                "profiles:AAPL",
                || async { Ok("Apple".to_string()) },
                default_classify,
                options.clone(),
            )
            .await
            .unwrap();

        clock.advance(Duration::from_secs(16));

        // stale 구간도 지나 다시 miss
        let value: String = gateway
            .resilient_call(
                &yahoo,
                "profiles:AAPL",
                || async { Ok("Apple Inc.".to_string()) },
                default_classify,
                options,
            )
            .await
            .unwrap();
        assert_eq!(value, "Apple Inc.");
    }
}
