//! # Feed Core
//!
//! 시장 데이터 수집 레이어의 공통 타입을 제공합니다.
//!
//! 이 크레이트는 resilience/cache 크레이트 전반에서 사용되는 기본 요소를 제공합니다:
//! - 에러 분류 (transient / fatal / admission rejection)
//! - 검증된 설정 구조체 (breaker, limiter, retry, cache, store)
//! - Provider 식별자
//! - 주입 가능한 시계 (테스트용 수동 시계 포함)
//! - 로깅 인프라

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::*;
pub use error::*;
pub use logging::{init_logging, init_logging_from_env, LogConfig, LogFormat};
pub use types::ProviderKey;
