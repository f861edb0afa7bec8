//! 분산 rate limiter.
//!
//! provider별로 토큰 버킷 또는 윈도우 카운터 알고리즘을 사용합니다.
//! 판정과 소비는 하나의 저장소 스크립트로 실행되므로 여러 프로세스가
//! 같은 provider를 호출해도 한도를 넘지 않습니다.
//!
//! 저장소가 응답하지 않으면 경고를 남기고 요청을 허용합니다.

use std::time::Duration;

use dashmap::DashMap;
use feed_core::{FeedError, FeedResult, LimiterAlgorithm, LimiterConfig, ProviderKey, SharedClock};
use feed_store::{parse_arg, parse_reply, LocalTxn, ScriptReply, SharedStore, StoreResult, StoreScript};
use serde::Serialize;
use tracing::{debug, warn};

/// Rate limit 판정 결과.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum RateDecision {
    /// 허용. `remaining`은 남은 토큰/슬롯 수 (저장소 장애로 판정하지 못했으면 `None`)
    Allowed { remaining: Option<f64> },
    /// 거부. `retry_after` 이후 다시 시도
    Denied { retry_after: Duration },
}

impl RateDecision {
    /// 허용 여부.
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }

    /// 거부된 경우 재시도까지 대기 시간.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RateDecision::Allowed { .. } => None,
            RateDecision::Denied { retry_after } => Some(*retry_after),
        }
    }

    /// 거부를 `FeedError::RateLimited`로 변환합니다.
    pub fn into_result(self, provider: &ProviderKey) -> FeedResult<Option<f64>> {
        match self {
            RateDecision::Allowed { remaining } => Ok(remaining),
            RateDecision::Denied { retry_after } => Err(FeedError::RateLimited {
                provider: provider.to_string(),
                retry_after,
            }),
        }
    }
}

// ==================== 저장소 스크립트 ====================
//
// KEYS[1] = 상태 해시
// ARGV    = capacity|limit, refill_rate|window_ms, requested, now_ms, ttl_ms, consume(1|0)
// 응답    = {allowed, remaining, wait_ms}

const TOKEN_BUCKET_LUA: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local requested = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])
local consume = ARGV[6] == '1'

local state = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last = tonumber(state[2])
if tokens == nil or last == nil then
  tokens = capacity
  last = now
end

local elapsed = math.max(0, now - last)
tokens = math.min(capacity, tokens + elapsed * rate / 1000)

local allowed = 0
local wait_ms = 0
if tokens >= requested then
  allowed = 1
  if consume then
    tokens = tokens - requested
  end
else
  wait_ms = math.floor((requested - tokens) * 1000 / rate) + 1
end

if consume then
  redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'last_refill', tostring(math.max(last, now)))
  redis.call('PEXPIRE', KEYS[1], ttl)
end

return {tostring(allowed), tostring(tokens), tostring(wait_ms)}
"#;

fn token_bucket_local(
    txn: &mut LocalTxn<'_>,
    keys: &[String],
    args: &[String],
) -> StoreResult<ScriptReply> {
    const NAME: &str = "token_bucket";
    let capacity: f64 = parse_arg(args, 0, NAME)?;
    let rate: f64 = parse_arg(args, 1, NAME)?;
    let requested: f64 = parse_arg(args, 2, NAME)?;
    let now: i64 = parse_arg(args, 3, NAME)?;
    let ttl: u64 = parse_arg(args, 4, NAME)?;
    let consume = args.get(5).map(|v| v == "1").unwrap_or(false);

    let state = txn.hmget(&keys[0], &["tokens", "last_refill"]);
    let stored_tokens = state[0].as_deref().and_then(|v| v.parse::<f64>().ok());
    let stored_last = state[1].as_deref().and_then(|v| v.parse::<i64>().ok());
    let (tokens, last) = match (stored_tokens, stored_last) {
        (Some(tokens), Some(last)) => (tokens, last),
        _ => (capacity, now),
    };

    let elapsed = (now - last).max(0) as f64;
    let mut tokens = capacity.min(tokens + elapsed * rate / 1000.0);

    let mut allowed = 0;
    let mut wait_ms = 0i64;
    if tokens >= requested {
        allowed = 1;
        if consume {
            tokens -= requested;
        }
    } else {
        wait_ms = ((requested - tokens) * 1000.0 / rate).floor() as i64 + 1;
    }

    if consume {
        txn.hset(
            &keys[0],
            &[
                ("tokens", tokens.to_string()),
                ("last_refill", last.max(now).to_string()),
            ],
        );
        txn.pexpire(&keys[0], Duration::from_millis(ttl));
    }

    Ok(vec![allowed.to_string(), tokens.to_string(), wait_ms.to_string()])
}

static TOKEN_BUCKET: StoreScript =
    StoreScript::new("token_bucket", TOKEN_BUCKET_LUA, token_bucket_local);

const SLIDING_WINDOW_LUA: &str = r#"
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local requested = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])
local consume = ARGV[6] == '1'

local state = redis.call('HMGET', KEYS[1], 'count', 'window_start')
local count = tonumber(state[1]) or 0
local start = tonumber(state[2])
if start == nil or math.max(0, now - start) >= window then
  count = 0
  start = now
end

local allowed = 0
local retry_ms = 0
if count + requested <= limit then
  allowed = 1
  if consume then
    count = count + requested
  end
else
  retry_ms = math.max(1, window - math.max(0, now - start))
end

if consume then
  redis.call('HSET', KEYS[1], 'count', tostring(count), 'window_start', tostring(start))
  redis.call('PEXPIRE', KEYS[1], ttl)
end

return {tostring(allowed), tostring(limit - count), tostring(retry_ms)}
"#;

fn sliding_window_local(
    txn: &mut LocalTxn<'_>,
    keys: &[String],
    args: &[String],
) -> StoreResult<ScriptReply> {
    const NAME: &str = "sliding_window";
    let limit: i64 = parse_arg(args, 0, NAME)?;
    let window: i64 = parse_arg(args, 1, NAME)?;
    let requested: i64 = parse_arg(args, 2, NAME)?;
    let now: i64 = parse_arg(args, 3, NAME)?;
    let ttl: u64 = parse_arg(args, 4, NAME)?;
    let consume = args.get(5).map(|v| v == "1").unwrap_or(false);

    let state = txn.hmget(&keys[0], &["count", "window_start"]);
    let mut count = state[0]
        .as_deref()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0);
    let mut start = match state[1].as_deref().and_then(|v| v.parse::<i64>().ok()) {
        Some(start) => start,
        None => {
            count = 0;
            now
        }
    };
    if (now - start).max(0) >= window {
        count = 0;
        start = now;
    }

    let mut allowed = 0;
    let mut retry_ms = 0;
    if count + requested <= limit {
        allowed = 1;
        if consume {
            count += requested;
        }
    } else {
        retry_ms = (window - (now - start).max(0)).max(1);
    }

    if consume {
        txn.hset(
            &keys[0],
            &[("count", count.to_string()), ("window_start", start.to_string())],
        );
        txn.pexpire(&keys[0], Duration::from_millis(ttl));
    }

    Ok(vec![
        allowed.to_string(),
        (limit - count).to_string(),
        retry_ms.to_string(),
    ])
}

static SLIDING_WINDOW: StoreScript =
    StoreScript::new("sliding_window", SLIDING_WINDOW_LUA, sliding_window_local);

// ==================== Rate Limiter ====================

/// 분산 rate limiter.
///
/// provider별 설정은 `configure`로 등록하고, 등록되지 않은 provider는 기본 설정을 사용합니다.
pub struct RateLimiter {
    store: SharedStore,
    clock: SharedClock,
    state_ttl: Duration,
    default_config: LimiterConfig,
    configs: DashMap<ProviderKey, LimiterConfig>,
}

impl RateLimiter {
    /// 새 Rate Limiter 생성.
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        default_config: LimiterConfig,
        state_ttl: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            state_ttl,
            default_config,
            configs: DashMap::new(),
        }
    }

    /// provider 설정 등록.
    pub fn configure(&self, provider: &ProviderKey, config: LimiterConfig) -> FeedResult<()> {
        config.validate()?;
        self.configs.insert(provider.clone(), config);
        Ok(())
    }

    /// provider에 적용되는 설정.
    pub fn config_for(&self, provider: &ProviderKey) -> LimiterConfig {
        self.configs
            .get(provider)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| self.default_config.clone())
    }

    fn state_key(provider: &ProviderKey, algorithm: LimiterAlgorithm) -> String {
        match algorithm {
            LimiterAlgorithm::TokenBucket => format!("rl:tb:{}", provider),
            LimiterAlgorithm::SlidingWindow => format!("rl:sw:{}", provider),
        }
    }

    /// 요청 1개를 판정하고 허용되면 소비합니다.
    pub async fn check_and_consume(&self, provider: &ProviderKey) -> FeedResult<RateDecision> {
        self.acquire(provider, 1).await
    }

    /// `n`개를 판정하고 허용되면 소비합니다.
    pub async fn acquire(&self, provider: &ProviderKey, n: u32) -> FeedResult<RateDecision> {
        let config = self.config_for(provider);
        self.acquire_with(provider, &config, n).await
    }

    /// 주어진 설정으로 `n`개를 판정합니다 (호출별 오버라이드용).
    ///
    /// `n`이 버킷 용량 또는 윈도우 한도를 넘으면 절대 허용될 수 없으므로 설정 오류를 반환합니다.
    pub async fn acquire_with(
        &self,
        provider: &ProviderKey,
        config: &LimiterConfig,
        n: u32,
    ) -> FeedResult<RateDecision> {
        check_request(config, n)?;

        match self.run(provider, config, n, true).await {
            Ok((allowed, remaining, wait_ms)) => {
                if allowed {
                    Ok(RateDecision::Allowed {
                        remaining: Some(remaining),
                    })
                } else {
                    let retry_after = Duration::from_millis(wait_ms);
                    debug!(
                        provider = %provider,
                        retry_after_ms = wait_ms,
                        "Rate limit 초과"
                    );
                    Ok(RateDecision::Denied { retry_after })
                }
            }
            Err(e) => {
                warn!(
                    provider = %provider,
                    error = %e,
                    "Rate limiter store unavailable, allowing request"
                );
                Ok(RateDecision::Allowed { remaining: None })
            }
        }
    }

    /// 소비 없이 남은 토큰/슬롯 수를 조회합니다.
    ///
    /// 저장소 오류 시 `None`.
    pub async fn peek(&self, provider: &ProviderKey) -> Option<f64> {
        let config = self.config_for(provider);
        match self.run(provider, &config, 1, false).await {
            Ok((_, remaining, _)) => Some(remaining),
            Err(e) => {
                debug!(provider = %provider, error = %e, "Rate limit 조회 실패");
                None
            }
        }
    }

    async fn run(
        &self,
        provider: &ProviderKey,
        config: &LimiterConfig,
        n: u32,
        consume: bool,
    ) -> StoreResult<(bool, f64, u64)> {
        let (script, first, second) = match config.algorithm {
            LimiterAlgorithm::TokenBucket => (
                &TOKEN_BUCKET,
                config.capacity.to_string(),
                config.refill_rate.to_string(),
            ),
            LimiterAlgorithm::SlidingWindow => (
                &SLIDING_WINDOW,
                config.limit.to_string(),
                config.window().as_millis().to_string(),
            ),
        };
        let ttl = self.state_ttl.max(config.window());

        let keys = vec![Self::state_key(provider, config.algorithm)];
        let args = vec![
            first,
            second,
            n.to_string(),
            self.clock.now_ms().to_string(),
            ttl.as_millis().to_string(),
            if consume { "1" } else { "0" }.to_string(),
        ];

        let reply = self.store.run_script(script, &keys, &args).await?;
        let allowed: i64 = parse_reply(&reply, 0, script.name())?;
        let remaining: f64 = parse_reply(&reply, 1, script.name())?;
        let wait_ms: i64 = parse_reply(&reply, 2, script.name())?;
        Ok((allowed == 1, remaining.max(0.0), wait_ms.max(0) as u64))
    }
}

fn check_request(config: &LimiterConfig, n: u32) -> FeedResult<()> {
    if n == 0 {
        return Err(FeedError::Validation(
            "rate limit request must be at least 1".to_string(),
        ));
    }
    let ceiling = match config.algorithm {
        LimiterAlgorithm::TokenBucket => config.capacity,
        LimiterAlgorithm::SlidingWindow => f64::from(config.limit),
    };
    if f64::from(n) > ceiling {
        return Err(FeedError::Config(format!(
            "requested {} exceeds limiter ceiling {}",
            n, ceiling
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use feed_core::ManualClock;
    use feed_store::testing::UnavailableStore;
    use feed_store::MemoryStore;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn provider() -> ProviderKey {
        ProviderKey::new("alpha_vantage").unwrap()
    }

    fn limiter(config: LimiterConfig) -> (Arc<ManualClock>, RateLimiter) {
        let clock = ManualClock::starting_at_epoch_2024();
        let store: SharedStore = Arc::new(MemoryStore::new(clock.clone()));
        let limiter = RateLimiter::new(store, clock.clone(), config, Duration::from_secs(3600));
        (clock, limiter)
    }

    #[tokio::test]
    async fn test_token_bucket_denies_when_empty() {
        let (_clock, limiter) = limiter(LimiterConfig::token_bucket(3.0, 1.0));
        let p = provider();

        for expected in [2.0, 1.0, 0.0] {
            let decision = limiter.check_and_consume(&p).await.unwrap();
            assert_eq!(decision, RateDecision::Allowed { remaining: Some(expected) });
        }

        let decision = limiter.check_and_consume(&p).await.unwrap();
        assert!(!decision.is_allowed());
        assert_eq!(decision.retry_after(), Some(Duration::from_millis(1001)));
    }

    #[tokio::test]
    async fn test_token_bucket_refills_over_time() {
        let (clock, limiter) = limiter(LimiterConfig::token_bucket(2.0, 2.0));
        let p = provider();

        limiter.acquire(&p, 2).await.unwrap();
        assert!(!limiter.check_and_consume(&p).await.unwrap().is_allowed());

        clock.advance(Duration::from_millis(500));
        assert!(limiter.check_and_consume(&p).await.unwrap().is_allowed());

        // 오래 기다려도 용량을 넘지 않음
        clock.advance(Duration::from_secs(60));
        assert_eq!(limiter.peek(&p).await, Some(2.0));
    }

    #[tokio::test]
    async fn test_waiting_wait_time_is_enough() {
        let (clock, limiter) = limiter(LimiterConfig::token_bucket(5.0, 0.75));
        let p = provider();

        limiter.acquire(&p, 5).await.unwrap();
        let decision = limiter.acquire(&p, 3).await.unwrap();
        let wait = decision.retry_after().unwrap();

        clock.advance(wait);
        assert!(limiter.acquire(&p, 3).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_request_above_capacity_is_config_error() {
        let (_clock, limiter) = limiter(LimiterConfig::token_bucket(5.0, 1.0));

        let err = limiter.acquire(&provider(), 6).await.unwrap_err();
        assert!(matches!(err, FeedError::Config(_)));
        assert!(limiter.acquire(&provider(), 0).await.is_err());
    }

    #[tokio::test]
    async fn test_sliding_window_denial_does_not_consume() {
        let (clock, limiter) = limiter(LimiterConfig::sliding_window(2, Duration::from_secs(10)));
        let p = provider();

        assert!(limiter.check_and_consume(&p).await.unwrap().is_allowed());
        clock.advance(Duration::from_secs(4));
        assert!(limiter.check_and_consume(&p).await.unwrap().is_allowed());

        let denied = limiter.check_and_consume(&p).await.unwrap();
        assert_eq!(denied.retry_after(), Some(Duration::from_secs(6)));
        assert_eq!(limiter.peek(&p).await, Some(0.0));

        // 새 윈도우 시작
        clock.advance(Duration::from_secs(6));
        let decision = limiter.check_and_consume(&p).await.unwrap();
        assert_eq!(decision, RateDecision::Allowed { remaining: Some(1.0) });
    }

    #[tokio::test]
    async fn test_providers_are_isolated() {
        let (_clock, limiter) = limiter(LimiterConfig::token_bucket(1.0, 0.1));
        let yahoo = ProviderKey::new("yahoo").unwrap();

        limiter
            .configure(&yahoo, LimiterConfig::token_bucket(5.0, 1.0))
            .unwrap();

        assert!(limiter.check_and_consume(&provider()).await.unwrap().is_allowed());
        assert!(!limiter.check_and_consume(&provider()).await.unwrap().is_allowed());
        assert!(limiter.check_and_consume(&yahoo).await.unwrap().is_allowed());
        assert_eq!(limiter.peek(&yahoo).await, Some(4.0));
    }

    #[tokio::test]
    async fn test_store_failure_allows_with_warning() {
        let clock = ManualClock::starting_at_epoch_2024();
        let limiter = RateLimiter::new(
            Arc::new(UnavailableStore),
            clock,
            LimiterConfig::token_bucket(1.0, 1.0),
            Duration::from_secs(60),
        );

        for _ in 0..5 {
            let decision = limiter.check_and_consume(&provider()).await.unwrap();
            assert_eq!(decision, RateDecision::Allowed { remaining: None });
        }
        assert_eq!(limiter.peek(&provider()).await, None);
    }

    #[test]
    fn test_denied_into_result() {
        let p = provider();
        let err = RateDecision::Denied {
            retry_after: Duration::from_secs(2),
        }
        .into_result(&p)
        .unwrap_err();
        assert!(err.is_admission_rejection());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    }

    proptest! {
        #[test]
        fn prop_tokens_stay_within_bounds(
            capacity in 1u32..20,
            rate in 0.1f64..10.0,
            steps in proptest::collection::vec((0u64..3_000, 1u32..20), 1..40),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let (clock, limiter) = limiter(LimiterConfig::token_bucket(f64::from(capacity), rate));
                let p = provider();
                for (advance_ms, n) in steps {
                    clock.advance(Duration::from_millis(advance_ms));
                    let n = n.min(capacity);
                    let decision = limiter.acquire(&p, n).await.unwrap();
                    if let RateDecision::Allowed { remaining: Some(left) } = decision {
                        prop_assert!(left >= 0.0);
                        prop_assert!(left <= f64::from(capacity));
                    }
                    let peeked = limiter.peek(&p).await.unwrap();
                    prop_assert!((0.0..=f64::from(capacity)).contains(&peeked));
                }
                Ok(())
            })?;
        }
    }
}
