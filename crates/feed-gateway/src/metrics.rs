//! Provider별 메트릭.
//!
//! 프로세스 로컬 카운터와 공유 저장소의 현재 상태(circuit, 남은 토큰)를 합쳐
//! `ProviderMetrics`를 구성합니다.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use feed_core::{FeedError, ProviderKey};
use feed_resilience::{CircuitCounters, CircuitState, RetryError, RetryStats};
use serde::Serialize;

/// 재시도 집계.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryCounts {
    /// 재시도 엔진을 거친 호출 수
    pub calls: u64,
    /// 첫 시도 이후 추가 시도 수
    pub retries: u64,
    /// 시도 소진으로 실패한 호출 수
    pub exhausted: u64,
    /// 재시도 불가 에러로 실패한 호출 수
    pub fatal: u64,
}

/// provider 메트릭 스냅샷.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderMetrics {
    pub provider: ProviderKey,
    pub circuit_state: CircuitState,
    /// 현재 연속 실패 횟수
    pub failure_count: u32,
    /// Open 상태에서 HalfOpen까지 남은 시간
    pub circuit_retry_after: Option<Duration>,
    /// 남은 토큰/슬롯 (저장소 장애 시 `None`)
    pub tokens_remaining: Option<f64>,
    pub cache_hit_rate: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub retry_counts: RetryCounts,
    /// rate limit으로 거부된 호출 수
    pub rate_limited: u64,
    /// circuit open으로 거부된 호출 수
    pub circuit_rejections: u64,
    pub circuit: CircuitCounters,
}

/// 로컬 카운터 스냅샷.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub retry_counts: RetryCounts,
    pub rate_limited: u64,
    pub circuit_rejections: u64,
}

impl CounterSnapshot {
    /// cache 적중률. 조회가 없으면 0.
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct ProviderCounters {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    calls: AtomicU64,
    retries: AtomicU64,
    exhausted: AtomicU64,
    fatal: AtomicU64,
    rate_limited: AtomicU64,
    circuit_rejections: AtomicU64,
}

/// provider별 카운터 모음.
#[derive(Default)]
pub struct MetricsRegistry {
    providers: DashMap<ProviderKey, Arc<ProviderCounters>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, provider: &ProviderKey) -> Arc<ProviderCounters> {
        self.providers.entry(provider.clone()).or_default().clone()
    }

    /// cache 조회 결과 기록.
    pub fn record_cache_lookup(&self, provider: &ProviderKey, hit: bool) {
        let counters = self.counters(provider);
        if hit {
            counters.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// 재시도 실행 결과 기록.
    pub fn record_retry<T, E>(
        &self,
        provider: &ProviderKey,
        result: &Result<T, RetryError<E>>,
        stats: &RetryStats,
    ) where
        E: std::error::Error + 'static,
    {
        let counters = self.counters(provider);
        counters.calls.fetch_add(1, Ordering::Relaxed);
        counters
            .retries
            .fetch_add(u64::from(stats.retries()), Ordering::Relaxed);
        match result {
            Err(RetryError::Exhausted { .. }) => {
                counters.exhausted.fetch_add(1, Ordering::Relaxed);
            }
            Err(RetryError::Fatal { .. }) => {
                counters.fatal.fetch_add(1, Ordering::Relaxed);
            }
            Ok(_) => {}
        }
    }

    /// admission 거부 기록.
    pub fn record_rejection(&self, provider: &ProviderKey, err: &FeedError) {
        let counters = self.counters(provider);
        match err {
            FeedError::RateLimited { .. } => {
                counters.rate_limited.fetch_add(1, Ordering::Relaxed);
            }
            FeedError::CircuitOpen { .. } => {
                counters.circuit_rejections.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// 카운터 스냅샷.
    pub fn snapshot(&self, provider: &ProviderKey) -> CounterSnapshot {
        let Some(counters) = self.providers.get(provider).map(|entry| entry.value().clone())
        else {
            return CounterSnapshot::default();
        };
        CounterSnapshot {
            cache_hits: counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: counters.cache_misses.load(Ordering::Relaxed),
            retry_counts: RetryCounts {
                calls: counters.calls.load(Ordering::Relaxed),
                retries: counters.retries.load(Ordering::Relaxed),
                exhausted: counters.exhausted.load(Ordering::Relaxed),
                fatal: counters.fatal.load(Ordering::Relaxed),
            },
            rate_limited: counters.rate_limited.load(Ordering::Relaxed),
            circuit_rejections: counters.circuit_rejections.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_per_provider() {
        let metrics = MetricsRegistry::new();
        let yahoo = ProviderKey::new("yahoo").unwrap();
        let fmp = ProviderKey::new("fmp").unwrap();

        metrics.record_cache_lookup(&yahoo, true);
        metrics.record_cache_lookup(&yahoo, true);
        metrics.record_cache_lookup(&yahoo, false);
        metrics.record_rejection(
            &fmp,
            &FeedError::RateLimited {
                provider: "fmp".into(),
                retry_after: Duration::from_secs(1),
            },
        );

        let y = metrics.snapshot(&yahoo);
        assert_eq!((y.cache_hits, y.cache_misses), (2, 1));
        assert!((y.cache_hit_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(y.rate_limited, 0);

        let f = metrics.snapshot(&fmp);
        assert_eq!(f.rate_limited, 1);
        assert_eq!(f.cache_hit_rate(), 0.0);
    }

    #[test]
    fn test_record_retry_outcomes() {
        let metrics = MetricsRegistry::new();
        let p = ProviderKey::new("yahoo").unwrap();
        let stats = RetryStats {
            attempts: 3,
            delays: vec![Duration::from_millis(100), Duration::from_millis(200)],
            last_class: None,
        };

        let exhausted: Result<(), RetryError<FeedError>> = Err(RetryError::Exhausted {
            source: FeedError::network("reset"),
            attempts: 3,
        });
        metrics.record_retry(&p, &exhausted, &stats);
        metrics.record_retry(&p, &Ok::<_, RetryError<FeedError>>(()), &RetryStats::default());

        let counts = metrics.snapshot(&p).retry_counts;
        assert_eq!(
            counts,
            RetryCounts {
                calls: 2,
                retries: 2,
                exhausted: 1,
                fatal: 0
            }
        );
    }
}
