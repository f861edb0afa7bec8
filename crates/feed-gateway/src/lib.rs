//! 시장 데이터 provider 호출 gateway.
//!
//! 이 크레이트는 다음을 제공합니다:
//! - ResilientGateway: cache → rate limit → circuit breaker → retry 파이프라인
//! - Provider 정책 registry (provider별 breaker/limiter/retry/cache 설정)
//! - Provider별 메트릭 (circuit 상태, 남은 토큰, cache 적중률, 재시도 집계)

pub mod metrics;
pub mod pipeline;
pub mod registry;

pub use metrics::{CounterSnapshot, MetricsRegistry, ProviderMetrics, RetryCounts};
pub use pipeline::{CallOptions, ResilientGateway};
pub use registry::ProviderRegistry;

// 호출자가 자주 쓰는 타입 재노출
pub use feed_cache::CacheLookup;
pub use feed_core::{FeedError, FeedResult, GatewayConfig, ProviderKey, ProviderPolicy};
pub use feed_resilience::{default_classify, CircuitState, ErrorClass};
