//! Provider 호출을 위한 resilience 컴포넌트.
//!
//! 이 크레이트는 다음을 제공합니다:
//! - Retry engine: 지수 backoff + jitter, 에러 분류 기반 재시도
//! - Rate limiter: 토큰 버킷 / 윈도우 카운터 (공유 저장소 스크립트로 원자적 판정)
//! - Circuit breaker: Closed/Open/HalfOpen 상태 머신 (공유 저장소 스크립트로 원자적 전이)
//!
//! 공유 저장소가 응답하지 않으면 모든 컴포넌트는 가용성을 우선합니다
//! (circuit → Closed, limiter → 경고 후 허용).

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitCounters, CircuitSnapshot, CircuitState};
pub use rate_limiter::{RateDecision, RateLimiter};
pub use retry::{default_classify, ErrorClass, RetryError, RetryPolicy, RetryStats};
