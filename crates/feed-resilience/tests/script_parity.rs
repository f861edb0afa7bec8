//! 저장소 스크립트의 Lua 본문과 로컬 구현이 같은 결과를 내는지 검증합니다.
//!
//! 같은 시나리오를 `MemoryStore`와 `RedisStore`에서 각각 실행해 관측 결과를 비교합니다.
//! `MemoryStore` 결과는 항상 기대값과 비교되고, Redis 비교는
//! `FEED_TEST_REDIS_URL`이 설정된 경우에만 실행됩니다.

use std::sync::Arc;
use std::time::Duration;

use feed_core::{BreakerConfig, LimiterConfig, ManualClock, ProviderKey, StoreConfig};
use feed_resilience::{CircuitBreaker, CircuitSnapshot, CircuitState, RateDecision, RateLimiter};
use feed_store::{MemoryStore, RedisStore, SharedStore, StateStore};

const STATE_TTL: Duration = Duration::from_secs(3600);

async fn redis_store(scenario: &str) -> Option<Arc<RedisStore>> {
    let Ok(url) = std::env::var("FEED_TEST_REDIS_URL") else {
        eprintln!("Skipping Redis comparison: FEED_TEST_REDIS_URL not set");
        return None;
    };
    let config = StoreConfig {
        url: Some(url),
        key_prefix: format!("feed-parity:{}:{}:", std::process::id(), scenario),
        command_timeout_ms: 2_000,
        ..Default::default()
    };
    let store = RedisStore::connect(&config).await.expect("Failed to connect");
    store.delete_prefix("").await.unwrap();
    Some(Arc::new(store))
}

fn allowed(remaining: f64) -> RateDecision {
    RateDecision::Allowed {
        remaining: Some(remaining),
    }
}

fn denied(ms: u64) -> RateDecision {
    RateDecision::Denied {
        retry_after: Duration::from_millis(ms),
    }
}

/// 각 요청의 판정과 직후 peek 결과.
async fn sliding_window_trace(store: SharedStore) -> Vec<(RateDecision, Option<f64>)> {
    let clock = ManualClock::starting_at_epoch_2024();
    let limiter = RateLimiter::new(
        store,
        clock.clone(),
        LimiterConfig::sliding_window(2, Duration::from_secs(10)),
        STATE_TTL,
    );
    let p = ProviderKey::new("sliding").unwrap();
    let mut trace = Vec::new();

    trace.push((limiter.check_and_consume(&p).await.unwrap(), limiter.peek(&p).await));
    clock.advance(Duration::from_secs(4));
    trace.push((limiter.check_and_consume(&p).await.unwrap(), limiter.peek(&p).await));
    // 거부된 요청은 카운트에 남지 않음
    trace.push((limiter.check_and_consume(&p).await.unwrap(), limiter.peek(&p).await));
    trace.push((limiter.acquire(&p, 2).await.unwrap(), limiter.peek(&p).await));
    clock.advance(Duration::from_secs(6));
    trace.push((limiter.check_and_consume(&p).await.unwrap(), limiter.peek(&p).await));
    trace.push((limiter.check_and_consume(&p).await.unwrap(), limiter.peek(&p).await));

    trace
}

#[tokio::test]
async fn test_sliding_window_script_parity() {
    let memory = sliding_window_trace(Arc::new(MemoryStore::new(
        ManualClock::starting_at_epoch_2024(),
    )))
    .await;

    assert_eq!(
        memory,
        vec![
            (allowed(1.0), Some(1.0)),
            (allowed(0.0), Some(0.0)),
            (denied(6_000), Some(0.0)),
            (denied(6_000), Some(0.0)),
            (allowed(1.0), Some(1.0)),
            (allowed(0.0), Some(0.0)),
        ]
    );

    let Some(redis) = redis_store("sliding").await else {
        return;
    };
    let remote = sliding_window_trace(redis.clone()).await;
    redis.delete_prefix("").await.unwrap();
    assert_eq!(remote, memory);
}

async fn token_bucket_trace(store: SharedStore) -> Vec<(RateDecision, Option<f64>)> {
    let clock = ManualClock::starting_at_epoch_2024();
    let limiter = RateLimiter::new(
        store,
        clock.clone(),
        LimiterConfig::token_bucket(3.0, 1.0),
        STATE_TTL,
    );
    let p = ProviderKey::new("bucket").unwrap();
    let mut trace = Vec::new();

    for _ in 0..4 {
        let decision = limiter.check_and_consume(&p).await.unwrap();
        trace.push((decision, limiter.peek(&p).await));
    }
    clock.advance(Duration::from_millis(500));
    let decision = limiter.check_and_consume(&p).await.unwrap();
    trace.push((decision, limiter.peek(&p).await));

    trace
}

#[tokio::test]
async fn test_token_bucket_script_parity() {
    let memory = token_bucket_trace(Arc::new(MemoryStore::new(
        ManualClock::starting_at_epoch_2024(),
    )))
    .await;

    assert_eq!(
        memory,
        vec![
            (allowed(2.0), Some(2.0)),
            (allowed(1.0), Some(1.0)),
            (allowed(0.0), Some(0.0)),
            (denied(1_001), Some(0.0)),
            (denied(501), Some(0.5)),
        ]
    );

    let Some(redis) = redis_store("bucket").await else {
        return;
    };
    let remote = token_bucket_trace(redis.clone()).await;
    redis.delete_prefix("").await.unwrap();
    assert_eq!(remote, memory);
}

/// Closed → Open → HalfOpen → Open → HalfOpen → Closed.
async fn circuit_trace(store: SharedStore) -> Vec<CircuitSnapshot> {
    let clock = ManualClock::starting_at_epoch_2024();
    let config = BreakerConfig::new(3, Duration::from_secs(30), 2);
    let breaker = CircuitBreaker::new(store, clock.clone(), config, STATE_TTL);
    let p = ProviderKey::new("circuit").unwrap();
    let mut trace = Vec::new();

    breaker.record_failure(&p).await;
    breaker.record_failure(&p).await;
    trace.push(breaker.snapshot(&p).await);

    breaker.record_failure(&p).await;
    trace.push(breaker.snapshot(&p).await);

    clock.advance(Duration::from_secs(10));
    trace.push(breaker.snapshot(&p).await);

    clock.advance(Duration::from_secs(20));
    trace.push(breaker.snapshot(&p).await);

    breaker.record_success(&p).await;
    trace.push(breaker.snapshot(&p).await);

    breaker.record_failure(&p).await;
    trace.push(breaker.snapshot(&p).await);

    clock.advance(Duration::from_secs(30));
    trace.push(breaker.snapshot(&p).await);

    breaker.record_success(&p).await;
    breaker.record_success(&p).await;
    trace.push(breaker.snapshot(&p).await);

    trace
}

#[tokio::test]
async fn test_circuit_script_parity() {
    let memory = circuit_trace(Arc::new(MemoryStore::new(
        ManualClock::starting_at_epoch_2024(),
    )))
    .await;

    let observed: Vec<_> = memory
        .iter()
        .map(|s| (s.state, s.failure_count, s.success_count, s.retry_after, s.transitioned))
        .collect();
    let secs = |n| Some(Duration::from_secs(n));
    assert_eq!(
        observed,
        vec![
            (CircuitState::Closed, 2, 0, None, false),
            (CircuitState::Open, 3, 0, secs(30), false),
            (CircuitState::Open, 3, 0, secs(20), false),
            (CircuitState::HalfOpen, 3, 0, None, true),
            (CircuitState::HalfOpen, 3, 1, None, false),
            (CircuitState::Open, 3, 0, secs(30), false),
            (CircuitState::HalfOpen, 3, 0, None, true),
            (CircuitState::Closed, 0, 0, None, false),
        ]
    );

    let Some(redis) = redis_store("circuit").await else {
        return;
    };
    let remote = circuit_trace(redis.clone()).await;
    redis.delete_prefix("").await.unwrap();
    assert_eq!(remote, memory);
}
