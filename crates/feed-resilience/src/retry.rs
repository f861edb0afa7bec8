//! Retry engine.
//!
//! 지수 backoff와 jitter를 적용해 제한된 횟수만큼 재시도합니다.
//!
//! ```text
//! delay(attempt) = min(max_delay, base_delay * exponential_base ^ attempt)
//! ```
//!
//! jitter가 켜져 있으면 `delay * (1 ± jitter_ratio)` 범위에서 균등하게 선택하고
//! `max_delay`로 제한합니다. 에러는 `classify`로 분류되며, Fatal은 대기 없이
//! 즉시 반환되고 Retryable은 시도 횟수가 소진될 때까지 재시도됩니다.

use std::future::Future;
use std::time::Duration;

use feed_core::{FeedError, RetryConfig};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

/// 에러 분류 결과.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 대기 후 재시도
    Retryable,
    /// 즉시 실패
    Fatal,
}

/// 기본 분류기.
///
/// 타임아웃, 연결 오류, 5xx, 429 → Retryable. 검증 실패, 그 외 4xx → Fatal.
pub fn default_classify(err: &FeedError) -> ErrorClass {
    if err.is_retryable() {
        ErrorClass::Retryable
    } else {
        ErrorClass::Fatal
    }
}

/// 한 번의 실행에 대한 재시도 통계.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryStats {
    /// 실제 시도 횟수
    pub attempts: u32,
    /// 시도 사이에 대기한 시간
    pub delays: Vec<Duration>,
    /// 마지막 실패의 분류
    pub last_class: Option<ErrorClass>,
}

impl RetryStats {
    /// 총 대기 시간.
    pub fn total_delay(&self) -> Duration {
        self.delays.iter().sum()
    }

    /// 재시도 횟수 (첫 시도 제외).
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// 재시도 실패.
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// 재시도 불가능한 에러
    #[error("non-retryable failure on attempt {attempts}: {source}")]
    Fatal { source: E, attempts: u32 },

    /// 시도 횟수 소진
    #[error("retries exhausted after {attempts} attempts: {source}")]
    Exhausted { source: E, attempts: u32 },
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// 시도 횟수.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Fatal { attempts, .. } | RetryError::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    /// 마지막 에러 참조.
    pub fn last_error(&self) -> &E {
        match self {
            RetryError::Fatal { source, .. } | RetryError::Exhausted { source, .. } => source,
        }
    }

    /// 마지막 에러 반환.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Fatal { source, .. } | RetryError::Exhausted { source, .. } => source,
        }
    }
}

impl From<RetryError<FeedError>> for FeedError {
    fn from(err: RetryError<FeedError>) -> Self {
        match err {
            RetryError::Fatal { source, .. } => source,
            RetryError::Exhausted { source, attempts } => FeedError::RetriesExhausted {
                attempts,
                source: Box::new(source),
            },
        }
    }
}

/// 재시도 정책.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    /// 새 정책 생성.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// 설정 참조.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// jitter 적용 전 대기 시간 (초).
    fn nominal_delay_secs(&self, attempt: u32) -> f64 {
        let base = self.config.base_delay().as_secs_f64();
        let max = self.config.max_delay().as_secs_f64();
        if base <= 0.0 {
            return 0.0;
        }
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        (base * self.config.exponential_base.powi(exponent)).min(max)
    }

    /// `attempt`번째 실패 후 대기 시간의 범위 (jitter 포함).
    ///
    /// 두 경계 모두 `attempt`에 대해 감소하지 않습니다.
    pub fn delay_bounds(&self, attempt: u32) -> (Duration, Duration) {
        let nominal = self.nominal_delay_secs(attempt);
        if !self.config.jitter || self.config.jitter_ratio <= 0.0 {
            let delay = Duration::from_secs_f64(nominal);
            return (delay, delay);
        }
        let max = self.config.max_delay().as_secs_f64();
        let spread = nominal * self.config.jitter_ratio;
        let low = (nominal - spread).max(0.0);
        let high = (nominal + spread).min(max);
        (Duration::from_secs_f64(low), Duration::from_secs_f64(high))
    }

    /// `attempt`번째 실패 후 대기 시간.
    pub fn delay(&self, attempt: u32) -> Duration {
        let (low, high) = self.delay_bounds(attempt);
        if low >= high {
            return low;
        }
        let secs = rand::thread_rng().gen_range(low.as_secs_f64()..=high.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// 작업을 재시도 정책에 따라 실행합니다.
    pub async fn execute<T, E, F, Fut, C>(&self, op: F, classify: C) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> ErrorClass,
        E: std::error::Error + 'static,
    {
        self.execute_with_hint(op, classify, |_| None).await.0
    }

    /// 통계와 함께 실행합니다.
    pub async fn execute_with_stats<T, E, F, Fut, C>(
        &self,
        op: F,
        classify: C,
    ) -> (Result<T, RetryError<E>>, RetryStats)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> ErrorClass,
        E: std::error::Error + 'static,
    {
        self.execute_with_hint(op, classify, |_| None).await
    }

    /// 에러가 알려주는 대기 시간 힌트(예: 429 `Retry-After`)를 반영해 실행합니다.
    ///
    /// 힌트는 backoff 대기 시간의 하한으로만 사용되며 `max_delay`를 넘지 않습니다.
    pub async fn execute_with_hint<T, E, F, Fut, C, H>(
        &self,
        mut op: F,
        classify: C,
        hint: H,
    ) -> (Result<T, RetryError<E>>, RetryStats)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> ErrorClass,
        H: Fn(&E) -> Option<Duration>,
        E: std::error::Error + 'static,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut stats = RetryStats::default();

        loop {
            stats.attempts += 1;
            let err = match op().await {
                Ok(value) => return (Ok(value), stats),
                Err(err) => err,
            };

            let class = classify(&err);
            stats.last_class = Some(class);

            if class == ErrorClass::Fatal {
                debug!(attempt = stats.attempts, error = %err, "재시도 불가능한 에러");
                let attempts = stats.attempts;
                return (Err(RetryError::Fatal { source: err, attempts }), stats);
            }

            if stats.attempts >= max_attempts {
                warn!(attempts = stats.attempts, error = %err, "재시도 소진");
                let attempts = stats.attempts;
                return (Err(RetryError::Exhausted { source: err, attempts }), stats);
            }

            let mut delay = self.delay(stats.attempts - 1);
            if let Some(hinted) = hint(&err) {
                delay = delay.max(hinted.min(self.config.max_delay()));
            }

            debug!(
                attempt = stats.attempts,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "재시도 대기"
            );
            tokio::time::sleep(delay).await;
            stats.delays.push(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn flaky(
        calls: Arc<AtomicU32>,
        failures: u32,
        err: FeedError,
    ) -> impl FnMut() -> std::future::Ready<Result<u32, FeedError>> {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= failures {
                std::future::ready(Err(err.clone()))
            } else {
                std::future::ready(Ok(n))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_makes_single_attempt_without_sleep() {
        let policy = RetryPolicy::new(RetryConfig::without_jitter(3, Duration::from_millis(100)));
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let (result, stats) = policy
            .execute_with_stats(
                flaky(calls.clone(), u32::MAX, FeedError::http(404, "unknown symbol")),
                default_classify,
            )
            .await;

        assert!(matches!(result, Err(RetryError::Fatal { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.total_delay(), Duration::ZERO);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_exhausts_max_attempts() {
        let policy = RetryPolicy::new(RetryConfig::without_jitter(3, Duration::from_millis(100)));
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let (result, stats) = policy
            .execute_with_stats(
                flaky(calls.clone(), u32::MAX, FeedError::timeout("upstream")),
                default_classify,
            )
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            stats.delays,
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        assert_eq!(started.elapsed(), Duration::from_millis(300));

        // 재시도 메타데이터를 유지한 채 FeedError로 변환
        let feed_err: FeedError = err.into();
        assert_eq!(feed_err.attempts(), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(RetryConfig::without_jitter(3, Duration::from_millis(50)));
        let calls = Arc::new(AtomicU32::new(0));

        let (result, stats) = policy
            .execute_with_stats(
                flaky(calls.clone(), 2, FeedError::network("reset")),
                default_classify,
            )
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.retries(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_raises_delay() {
        let policy = RetryPolicy::new(RetryConfig::without_jitter(2, Duration::from_millis(100)));
        let calls = Arc::new(AtomicU32::new(0));
        let throttled = FeedError::http(429, "slow down").with_retry_after(Duration::from_secs(2));

        let (_, stats) = policy
            .execute_with_hint(
                flaky(calls, u32::MAX, throttled),
                default_classify,
                FeedError::retry_after,
            )
            .await;

        assert_eq!(stats.delays, vec![Duration::from_secs(2)]);
    }

    #[test]
    fn test_delay_capped_at_max() {
        let config = RetryConfig {
            base_delay_ms: 1_000,
            max_delay_ms: 5_000,
            jitter: false,
            ..Default::default()
        };
        let policy = RetryPolicy::new(config);

        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(5));
        assert_eq!(policy.delay(40), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_within_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 0..5 {
            let (low, high) = policy.delay_bounds(attempt);
            assert!(low < high);
            for _ in 0..50 {
                let delay = policy.delay(attempt);
                assert!(delay >= low && delay <= high);
            }
        }
    }

    proptest! {
        #[test]
        fn prop_delay_bounds_non_decreasing(
            base_ms in 0u64..2_000,
            extra_ms in 0u64..60_000,
            exp in 1.0f64..4.0,
            ratio in 0.0f64..0.9,
            jitter in any::<bool>(),
        ) {
            let config = RetryConfig {
                max_attempts: 10,
                base_delay_ms: base_ms,
                max_delay_ms: base_ms + extra_ms,
                exponential_base: exp,
                jitter,
                jitter_ratio: ratio,
            };
            let policy = RetryPolicy::new(config.clone());
            let mut previous = (Duration::ZERO, Duration::ZERO);
            for attempt in 0..10 {
                let bounds = policy.delay_bounds(attempt);
                prop_assert!(bounds.0 <= bounds.1);
                prop_assert!(bounds.1 <= config.max_delay());
                prop_assert!(bounds.0 >= previous.0);
                prop_assert!(bounds.1 >= previous.1);
                previous = bounds;
            }
        }
    }
}
