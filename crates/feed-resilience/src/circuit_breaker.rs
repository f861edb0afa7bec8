//! 분산 Circuit Breaker.
//!
//! 장애가 난 provider에 대한 호출을 빠르게 차단해 연쇄 실패를 방지합니다.
//! 상태는 공유 저장소에 provider별 해시로 저장되며, 모든 전이는 저장소
//! 스크립트 안에서 원자적으로 계산됩니다.
//!
//! # 상태 전이
//!
//! ```text
//! Closed ──[실패 임계치 도달]──> Open
//!    ↑                            │
//!    │                  [recovery_time 경과 후 첫 조회]
//!    │                            ↓
//!    └──[성공 임계치]── HalfOpen ──[실패]──> Open
//! ```
//!
//! Open → HalfOpen 전이는 타이머 없이 다음 상태 조회 시점에 계산되고 저장됩니다.
//! 저장소가 응답하지 않으면 Closed로 간주합니다 (가용성 우선).

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use feed_core::{BreakerConfig, FeedError, FeedResult, ProviderKey, SharedClock};
use feed_store::{
    parse_arg, parse_reply, LocalTxn, ScriptReply, SharedStore, StoreError, StoreResult,
    StoreScript,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Circuit 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// 정상 상태 - 요청 허용
    #[default]
    Closed,
    /// 차단 상태 - 요청 거부
    Open,
    /// 복구 테스트 상태 - 시험 요청을 허용
    HalfOpen,
}

impl CircuitState {
    fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CircuitState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(CircuitState::Closed),
            "open" => Ok(CircuitState::Open),
            "half_open" => Ok(CircuitState::HalfOpen),
            other => Err(StoreError::InvalidReply(format!(
                "unknown circuit state '{}'",
                other
            ))),
        }
    }
}

/// 한 provider의 circuit 상태 스냅샷.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub provider: ProviderKey,
    pub state: CircuitState,
    /// 현재 연속 실패 횟수
    pub failure_count: u32,
    /// HalfOpen에서의 연속 성공 횟수
    pub success_count: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    /// 마지막으로 Open된 시각
    pub opened_at: Option<DateTime<Utc>>,
    /// Open 상태에서 HalfOpen까지 남은 시간
    pub retry_after: Option<Duration>,
    /// 이번 조회에서 Open → HalfOpen 전이가 일어났는지
    pub transitioned: bool,
}

impl CircuitSnapshot {
    fn closed(provider: &ProviderKey) -> Self {
        Self {
            provider: provider.clone(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            last_success: None,
            opened_at: None,
            retry_after: None,
            transitioned: false,
        }
    }
}

/// 프로세스 로컬 누적 카운터 (메트릭용).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CircuitCounters {
    /// 총 성공 횟수
    pub total_successes: u64,
    /// 총 실패 횟수
    pub total_failures: u64,
    /// 이 프로세스가 관측한 Open 전이 횟수
    pub open_count: u64,
    /// Open 상태로 거부된 호출 수
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct AtomicCounters {
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    open_count: AtomicU64,
    rejected: AtomicU64,
}

impl AtomicCounters {
    fn snapshot(&self) -> CircuitCounters {
        CircuitCounters {
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            open_count: self.open_count.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    fn as_arg(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

// ==================== 저장소 스크립트 ====================
//
// 상태 해시 필드: state, failures, successes, last_failure, last_success, opened_at
// 시각은 모두 epoch 밀리초이며 0은 "없음"을 뜻합니다.

const FIELDS: [&str; 6] = [
    "state",
    "failures",
    "successes",
    "last_failure",
    "last_success",
    "opened_at",
];

/// 저장된 circuit 해시.
struct StoredCircuit {
    state: String,
    failures: i64,
    successes: i64,
    last_failure: i64,
    last_success: i64,
    opened_at: i64,
}

impl StoredCircuit {
    fn load(txn: &mut LocalTxn<'_>, key: &str) -> Self {
        let raw = txn.hmget(key, &FIELDS);
        let number = |index: usize| -> i64 {
            raw[index]
                .as_deref()
                .and_then(|v| v.parse::<f64>().ok())
                .map(|v| v as i64)
                .unwrap_or(0)
        };
        Self {
            state: raw[0].clone().unwrap_or_else(|| "closed".to_string()),
            failures: number(1),
            successes: number(2),
            last_failure: number(3),
            last_success: number(4),
            opened_at: number(5),
        }
    }
}

// KEYS[1] = circuit 해시
// ARGV    = recovery_ms, now_ms, ttl_ms
// 응답    = {state, failures, successes, last_failure, last_success, opened_at, retry_after_ms, transitioned}
const ADMIT_LUA: &str = r#"
local recovery = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])

local s = redis.call('HMGET', KEYS[1], 'state', 'failures', 'successes', 'last_failure', 'last_success', 'opened_at')
local state = s[1] or 'closed'
local failures = tonumber(s[2]) or 0
local successes = tonumber(s[3]) or 0
local last_failure = tonumber(s[4]) or 0
local last_success = tonumber(s[5]) or 0
local opened_at = tonumber(s[6]) or 0

local retry_after = 0
local transitioned = 0
if state == 'open' then
  local elapsed = math.max(0, now - last_failure)
  if elapsed >= recovery then
    state = 'half_open'
    successes = 0
    transitioned = 1
    redis.call('HSET', KEYS[1], 'state', state, 'successes', '0')
    redis.call('PEXPIRE', KEYS[1], ttl)
  else
    retry_after = recovery - elapsed
  end
end

return {state, tostring(failures), tostring(successes), tostring(last_failure),
        tostring(last_success), tostring(opened_at), tostring(retry_after), tostring(transitioned)}
"#;

fn admit_local(txn: &mut LocalTxn<'_>, keys: &[String], args: &[String]) -> StoreResult<ScriptReply> {
    const NAME: &str = "circuit_admit";
    let recovery: i64 = parse_arg(args, 0, NAME)?;
    let now: i64 = parse_arg(args, 1, NAME)?;
    let ttl: u64 = parse_arg(args, 2, NAME)?;

    let mut c = StoredCircuit::load(txn, &keys[0]);
    let mut retry_after = 0;
    let mut transitioned = 0;
    if c.state == "open" {
        let elapsed = (now - c.last_failure).max(0);
        if elapsed >= recovery {
            c.state = "half_open".to_string();
            c.successes = 0;
            transitioned = 1;
            txn.hset(
                &keys[0],
                &[("state", c.state.clone()), ("successes", "0".to_string())],
            );
            txn.pexpire(&keys[0], Duration::from_millis(ttl));
        } else {
            retry_after = recovery - elapsed;
        }
    }

    Ok(vec![
        c.state,
        c.failures.to_string(),
        c.successes.to_string(),
        c.last_failure.to_string(),
        c.last_success.to_string(),
        c.opened_at.to_string(),
        retry_after.to_string(),
        transitioned.to_string(),
    ])
}

static CIRCUIT_ADMIT: StoreScript = StoreScript::new("circuit_admit", ADMIT_LUA, admit_local);

// KEYS[1] = circuit 해시
// ARGV    = outcome, failure_threshold, success_threshold, monitoring_ms, now_ms, ttl_ms
// 응답    = {prev_state, new_state, failures, successes}
const RECORD_LUA: &str = r#"
local outcome = ARGV[1]
local failure_threshold = tonumber(ARGV[2])
local success_threshold = tonumber(ARGV[3])
local monitoring = tonumber(ARGV[4])
local now = tonumber(ARGV[5])
local ttl = tonumber(ARGV[6])

local s = redis.call('HMGET', KEYS[1], 'state', 'failures', 'successes', 'last_failure', 'last_success', 'opened_at')
local state = s[1] or 'closed'
local failures = tonumber(s[2]) or 0
local successes = tonumber(s[3]) or 0
local last_failure = tonumber(s[4]) or 0
local opened_at = tonumber(s[6]) or 0
local prev = state

if prev == 'open' then
  return {prev, state, tostring(failures), tostring(successes)}
end

if outcome == 'success' then
  if state == 'closed' then
    failures = 0
  else
    successes = successes + 1
    if successes >= success_threshold then
      state = 'closed'
      failures = 0
      successes = 0
    end
  end
  redis.call('HSET', KEYS[1], 'state', state, 'failures', tostring(failures),
             'successes', tostring(successes), 'last_success', tostring(now))
else
  if state == 'closed' then
    if monitoring > 0 and last_failure > 0 and now - last_failure > monitoring then
      failures = 0
    end
    failures = failures + 1
    if failures >= failure_threshold then
      state = 'open'
      opened_at = now
    end
  else
    state = 'open'
    successes = 0
    opened_at = now
  end
  redis.call('HSET', KEYS[1], 'state', state, 'failures', tostring(failures),
             'successes', tostring(successes), 'last_failure', tostring(now),
             'opened_at', tostring(opened_at))
end
redis.call('PEXPIRE', KEYS[1], ttl)

return {prev, state, tostring(failures), tostring(successes)}
"#;

fn record_local(txn: &mut LocalTxn<'_>, keys: &[String], args: &[String]) -> StoreResult<ScriptReply> {
    const NAME: &str = "circuit_record";
    let outcome: String = parse_arg(args, 0, NAME)?;
    let failure_threshold: i64 = parse_arg(args, 1, NAME)?;
    let success_threshold: i64 = parse_arg(args, 2, NAME)?;
    let monitoring: i64 = parse_arg(args, 3, NAME)?;
    let now: i64 = parse_arg(args, 4, NAME)?;
    let ttl: u64 = parse_arg(args, 5, NAME)?;

    let mut c = StoredCircuit::load(txn, &keys[0]);
    let prev = c.state.clone();

    if prev == "open" {
        return Ok(vec![
            prev,
            c.state,
            c.failures.to_string(),
            c.successes.to_string(),
        ]);
    }

    if outcome == "success" {
        if c.state == "closed" {
            c.failures = 0;
        } else {
            c.successes += 1;
            if c.successes >= success_threshold {
                c.state = "closed".to_string();
                c.failures = 0;
                c.successes = 0;
            }
        }
        txn.hset(
            &keys[0],
            &[
                ("state", c.state.clone()),
                ("failures", c.failures.to_string()),
                ("successes", c.successes.to_string()),
                ("last_success", now.to_string()),
            ],
        );
    } else {
        if c.state == "closed" {
            if monitoring > 0 && c.last_failure > 0 && now - c.last_failure > monitoring {
                c.failures = 0;
            }
            c.failures += 1;
            if c.failures >= failure_threshold {
                c.state = "open".to_string();
                c.opened_at = now;
            }
        } else {
            c.state = "open".to_string();
            c.successes = 0;
            c.opened_at = now;
        }
        txn.hset(
            &keys[0],
            &[
                ("state", c.state.clone()),
                ("failures", c.failures.to_string()),
                ("successes", c.successes.to_string()),
                ("last_failure", now.to_string()),
                ("opened_at", c.opened_at.to_string()),
            ],
        );
    }
    txn.pexpire(&keys[0], Duration::from_millis(ttl));

    Ok(vec![
        prev,
        c.state,
        c.failures.to_string(),
        c.successes.to_string(),
    ])
}

static CIRCUIT_RECORD: StoreScript = StoreScript::new("circuit_record", RECORD_LUA, record_local);

// ==================== Circuit Breaker ====================

/// 분산 Circuit Breaker.
///
/// 하나의 인스턴스가 모든 provider의 circuit을 관리합니다. 상태는 저장소에 있고,
/// 인스턴스는 provider별 설정과 로컬 메트릭 카운터만 가집니다.
///
/// # 사용 예시
///
/// ```ignore
/// let breaker = CircuitBreaker::new(store, clock, BreakerConfig::default(), state_ttl);
///
/// let quote = breaker
///     .execute(&provider, async { client.fetch_quote("AAPL").await })
///     .await?; // Open이면 네트워크 호출 없이 FeedError::CircuitOpen
/// ```
pub struct CircuitBreaker {
    store: SharedStore,
    clock: SharedClock,
    state_ttl: Duration,
    default_config: BreakerConfig,
    configs: DashMap<ProviderKey, BreakerConfig>,
    counters: DashMap<ProviderKey, Arc<AtomicCounters>>,
}

impl CircuitBreaker {
    /// 새 Circuit Breaker 생성.
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        default_config: BreakerConfig,
        state_ttl: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            state_ttl,
            default_config,
            configs: DashMap::new(),
            counters: DashMap::new(),
        }
    }

    /// provider 설정 등록.
    pub fn configure(&self, provider: &ProviderKey, config: BreakerConfig) -> FeedResult<()> {
        config.validate()?;
        self.configs.insert(provider.clone(), config);
        Ok(())
    }

    /// provider에 적용되는 설정.
    pub fn config_for(&self, provider: &ProviderKey) -> BreakerConfig {
        self.configs
            .get(provider)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| self.default_config.clone())
    }

    fn state_key(provider: &ProviderKey) -> String {
        format!("cb:{}", provider)
    }

    fn local_counters(&self, provider: &ProviderKey) -> Arc<AtomicCounters> {
        self.counters.entry(provider.clone()).or_default().clone()
    }

    /// 작업을 circuit 보호 아래에서 실행합니다.
    ///
    /// Open이면 작업을 실행하지 않고 `FeedError::CircuitOpen`을 반환합니다.
    /// provider 장애로 분류되는 에러만 실패로 기록됩니다.
    pub async fn execute<T, Fut>(&self, provider: &ProviderKey, fut: Fut) -> FeedResult<T>
    where
        Fut: Future<Output = FeedResult<T>>,
    {
        let config = self.config_for(provider);
        self.execute_with(provider, &config, fut, FeedError::is_provider_fault)
            .await
    }

    /// 설정과 실패 판정 함수를 지정해 실행합니다.
    pub async fn execute_with<T, Fut, P>(
        &self,
        provider: &ProviderKey,
        config: &BreakerConfig,
        fut: Fut,
        counts_as_failure: P,
    ) -> FeedResult<T>
    where
        Fut: Future<Output = FeedResult<T>>,
        P: Fn(&FeedError) -> bool,
    {
        self.admit(provider, config).await?;

        match fut.await {
            Ok(value) => {
                self.record(provider, config, Outcome::Success).await;
                Ok(value)
            }
            Err(e) => {
                if counts_as_failure(&e) {
                    self.record(provider, config, Outcome::Failure).await;
                } else {
                    debug!(
                        circuit_breaker = %provider,
                        error = %e,
                        "Error not counted as provider failure"
                    );
                }
                Err(e)
            }
        }
    }

    /// 호출 허용 여부 판정. Open이면 `FeedError::CircuitOpen`.
    pub async fn admit(&self, provider: &ProviderKey, config: &BreakerConfig) -> FeedResult<()> {
        let snapshot = self.read(provider, config).await;
        if snapshot.state == CircuitState::Open {
            self.local_counters(provider)
                .rejected
                .fetch_add(1, Ordering::Relaxed);
            let retry_after = snapshot.retry_after.unwrap_or(Duration::ZERO);
            debug!(
                circuit_breaker = %provider,
                retry_after_ms = retry_after.as_millis() as u64,
                "Circuit open, rejecting call"
            );
            return Err(FeedError::CircuitOpen {
                provider: provider.to_string(),
                retry_after,
            });
        }
        Ok(())
    }

    /// 현재 상태 (Open → HalfOpen 지연 전이 포함).
    pub async fn state(&self, provider: &ProviderKey) -> CircuitState {
        self.snapshot(provider).await.state
    }

    /// 현재 상태 스냅샷.
    pub async fn snapshot(&self, provider: &ProviderKey) -> CircuitSnapshot {
        let config = self.config_for(provider);
        self.read(provider, &config).await
    }

    /// 로컬 누적 카운터.
    pub fn counters(&self, provider: &ProviderKey) -> CircuitCounters {
        self.counters
            .get(provider)
            .map(|entry| entry.value().snapshot())
            .unwrap_or_default()
    }

    /// 성공 기록.
    pub async fn record_success(&self, provider: &ProviderKey) {
        let config = self.config_for(provider);
        self.record(provider, &config, Outcome::Success).await;
    }

    /// 실패 기록.
    pub async fn record_failure(&self, provider: &ProviderKey) {
        let config = self.config_for(provider);
        self.record(provider, &config, Outcome::Failure).await;
    }

    /// 수동으로 Circuit 리셋 (Closed, 카운터 초기화).
    pub async fn reset(&self, provider: &ProviderKey) -> FeedResult<()> {
        self.store.delete(&Self::state_key(provider)).await?;
        info!(circuit_breaker = %provider, "Circuit breaker manually reset");
        Ok(())
    }

    async fn read(&self, provider: &ProviderKey, config: &BreakerConfig) -> CircuitSnapshot {
        match self.try_read(provider, config).await {
            Ok(snapshot) => {
                if snapshot.transitioned {
                    info!(
                        circuit_breaker = %provider,
                        "Circuit breaker timeout: Open -> HalfOpen"
                    );
                }
                snapshot
            }
            Err(e) => {
                warn!(
                    circuit_breaker = %provider,
                    error = %e,
                    "Circuit state unavailable, treating as Closed"
                );
                CircuitSnapshot::closed(provider)
            }
        }
    }

    async fn try_read(
        &self,
        provider: &ProviderKey,
        config: &BreakerConfig,
    ) -> StoreResult<CircuitSnapshot> {
        let keys = vec![Self::state_key(provider)];
        let args = vec![
            config.recovery_time_ms.to_string(),
            self.clock.now_ms().to_string(),
            self.state_ttl.as_millis().to_string(),
        ];
        let reply = self.store.run_script(&CIRCUIT_ADMIT, &keys, &args).await?;
        let name = CIRCUIT_ADMIT.name();

        let state: CircuitState = reply
            .first()
            .ok_or_else(|| StoreError::InvalidReply(format!("{}: empty reply", name)))?
            .parse()?;
        let failures: u32 = parse_reply(&reply, 1, name)?;
        let successes: u32 = parse_reply(&reply, 2, name)?;
        let last_failure: i64 = parse_reply(&reply, 3, name)?;
        let last_success: i64 = parse_reply(&reply, 4, name)?;
        let opened_at: i64 = parse_reply(&reply, 5, name)?;
        let retry_after_ms: u64 = parse_reply(&reply, 6, name)?;
        let transitioned: u8 = parse_reply(&reply, 7, name)?;

        Ok(CircuitSnapshot {
            provider: provider.clone(),
            state,
            failure_count: failures,
            success_count: successes,
            last_failure: timestamp(last_failure),
            last_success: timestamp(last_success),
            opened_at: timestamp(opened_at),
            retry_after: (state == CircuitState::Open)
                .then(|| Duration::from_millis(retry_after_ms)),
            transitioned: transitioned == 1,
        })
    }

    async fn record(&self, provider: &ProviderKey, config: &BreakerConfig, outcome: Outcome) {
        let counters = self.local_counters(provider);
        match outcome {
            Outcome::Success => counters.total_successes.fetch_add(1, Ordering::Relaxed),
            Outcome::Failure => counters.total_failures.fetch_add(1, Ordering::Relaxed),
        };

        let keys = vec![Self::state_key(provider)];
        let args = vec![
            outcome.as_arg().to_string(),
            config.failure_threshold.to_string(),
            config.success_threshold.to_string(),
            config.monitoring_period_ms.to_string(),
            self.clock.now_ms().to_string(),
            self.state_ttl.as_millis().to_string(),
        ];

        let reply = match self.store.run_script(&CIRCUIT_RECORD, &keys, &args).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    circuit_breaker = %provider,
                    outcome = outcome.as_arg(),
                    error = %e,
                    "Failed to record circuit outcome"
                );
                return;
            }
        };

        let prev = reply.first().and_then(|s| s.parse::<CircuitState>().ok());
        let next = reply.get(1).and_then(|s| s.parse::<CircuitState>().ok());
        let failure_count = reply.get(2).map(String::as_str).unwrap_or("?");

        match (prev, next) {
            (Some(CircuitState::Closed), Some(CircuitState::Open)) => {
                counters.open_count.fetch_add(1, Ordering::Relaxed);
                warn!(
                    circuit_breaker = %provider,
                    failure_count,
                    threshold = config.failure_threshold,
                    "Circuit breaker tripped: Closed -> Open"
                );
            }
            (Some(CircuitState::HalfOpen), Some(CircuitState::Open)) => {
                counters.open_count.fetch_add(1, Ordering::Relaxed);
                warn!(
                    circuit_breaker = %provider,
                    "Circuit breaker recovery failed: HalfOpen -> Open"
                );
            }
            (Some(CircuitState::HalfOpen), Some(CircuitState::Closed)) => {
                info!(
                    circuit_breaker = %provider,
                    "Circuit breaker recovered: HalfOpen -> Closed"
                );
            }
            _ => {}
        }
    }
}

fn timestamp(millis: i64) -> Option<DateTime<Utc>> {
    if millis > 0 {
        DateTime::from_timestamp_millis(millis)
    } else {
        None
    }
}
