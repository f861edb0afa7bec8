//! 데이터 수집 레이어의 에러 타입.
//!
//! 모든 provider 호출 결과는 다음 분류 중 하나로 표현됩니다:
//!
//! - **Transient**: 네트워크/타임아웃/5xx/429 - 재시도 가능
//! - **Fatal / Validation**: 4xx/검증 실패 - 재시도 불가
//! - **RateLimited / CircuitOpen**: 네트워크 호출 전 admission 거부 (`retry_after` 포함)
//! - **Cache**: 직렬화/저장소 실패 - cache miss로 강등되며 호출자에게 노출되지 않음

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Transient 에러 세부 유형.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransientKind {
    /// 연결 실패, 연결 끊김
    Network,
    /// 요청 타임아웃
    Timeout,
    /// 5xx 계열 서버 오류
    Server,
    /// 429 Too Many Requests
    TooManyRequests,
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransientKind::Network => write!(f, "network"),
            TransientKind::Timeout => write!(f, "timeout"),
            TransientKind::Server => write!(f, "server"),
            TransientKind::TooManyRequests => write!(f, "too_many_requests"),
        }
    }
}

/// 데이터 수집 에러.
#[derive(Debug, Clone, Error)]
pub enum FeedError {
    /// 일시적 오류 (재시도 가능)
    #[error("Transient {kind} error: {message}")]
    Transient {
        kind: TransientKind,
        message: String,
        /// provider가 알려준 재시도 대기 시간
        retry_after: Option<Duration>,
    },

    /// HTTP 상태 코드 기반 오류
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    /// 요청 검증 실패
    #[error("Validation error: {0}")]
    Validation(String),

    /// 재시도 불가능한 오류
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// Rate limit admission 거부
    #[error("Rate limit exceeded for '{provider}' (retry after {retry_after:?})")]
    RateLimited {
        provider: String,
        retry_after: Duration,
    },

    /// Circuit breaker admission 거부
    #[error("Circuit breaker '{provider}' is open (retry after {retry_after:?})")]
    CircuitOpen {
        provider: String,
        retry_after: Duration,
    },

    /// 재시도 소진
    #[error("Retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<FeedError>,
    },

    /// Cache 오류
    #[error("Cache error: {0}")]
    Cache(String),

    /// 공유 저장소 오류
    #[error("Store error: {0}")]
    Store(String),

    /// 직렬화/역직렬화 오류
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// 설정 오류
    #[error("Configuration error: {0}")]
    Config(String),
}

/// 데이터 수집 작업을 위한 Result 타입.
pub type FeedResult<T> = Result<T, FeedError>;

impl FeedError {
    /// 네트워크 오류 생성.
    pub fn network(message: impl Into<String>) -> Self {
        FeedError::Transient {
            kind: TransientKind::Network,
            message: message.into(),
            retry_after: None,
        }
    }

    /// 타임아웃 오류 생성.
    pub fn timeout(message: impl Into<String>) -> Self {
        FeedError::Transient {
            kind: TransientKind::Timeout,
            message: message.into(),
            retry_after: None,
        }
    }

    /// HTTP 상태 코드 오류 생성.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        FeedError::Http {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    /// 재시도 가능한 에러인지 확인.
    ///
    /// 타임아웃, 연결 오류, 5xx, 408, 429는 재시도 가능합니다.
    pub fn is_retryable(&self) -> bool {
        match self {
            FeedError::Transient { .. } => true,
            FeedError::Http { status, .. } => {
                *status == 408 || *status == 429 || (500..600).contains(status)
            }
            FeedError::Store(_) => true,
            _ => false,
        }
    }

    /// 네트워크 호출 전에 거부된 요청인지 확인.
    pub fn is_admission_rejection(&self) -> bool {
        matches!(
            self,
            FeedError::RateLimited { .. } | FeedError::CircuitOpen { .. }
        )
    }

    /// provider 측 장애로 볼 수 있는 에러인지 확인.
    ///
    /// 검증 실패나 잘못된 요청(4xx)은 provider 상태와 무관하므로
    /// circuit breaker 실패로 집계하지 않습니다.
    pub fn is_provider_fault(&self) -> bool {
        match self {
            FeedError::Transient { .. } => true,
            FeedError::Http { .. } => self.is_retryable(),
            FeedError::RetriesExhausted { source, .. } => source.is_provider_fault(),
            FeedError::Serialization(_) => true,
            _ => false,
        }
    }

    /// 기계 판독 가능한 재시도 대기 시간.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FeedError::RateLimited { retry_after, .. }
            | FeedError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            FeedError::Transient { retry_after, .. } | FeedError::Http { retry_after, .. } => {
                *retry_after
            }
            FeedError::RetriesExhausted { source, .. } => source.retry_after(),
            _ => None,
        }
    }

    /// 재시도 소진 시 시도 횟수.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            FeedError::RetriesExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// 재시도 대기 시간 힌트 추가.
    pub fn with_retry_after(mut self, hint: Duration) -> Self {
        match &mut self {
            FeedError::Transient { retry_after, .. } | FeedError::Http { retry_after, .. } => {
                *retry_after = Some(hint);
            }
            _ => {}
        }
        self
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for FeedError {
    fn from(err: config::ConfigError) -> Self {
        FeedError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(FeedError::network("connection reset").is_retryable());
        assert!(FeedError::timeout("5s elapsed").is_retryable());
        assert!(FeedError::http(503, "unavailable").is_retryable());
        assert!(FeedError::http(429, "slow down").is_retryable());

        assert!(!FeedError::http(404, "unknown symbol").is_retryable());
        assert!(!FeedError::Validation("empty symbol".to_string()).is_retryable());
        assert!(!FeedError::Fatal("bad api key".to_string()).is_retryable());
    }

    #[test]
    fn test_admission_rejection_carries_retry_after() {
        let rate = FeedError::RateLimited {
            provider: "yahoo".to_string(),
            retry_after: Duration::from_millis(250),
        };
        assert!(rate.is_admission_rejection());
        assert_eq!(rate.retry_after(), Some(Duration::from_millis(250)));

        let open = FeedError::CircuitOpen {
            provider: "yahoo".to_string(),
            retry_after: Duration::from_secs(12),
        };
        assert!(open.is_admission_rejection());
        assert_eq!(open.retry_after(), Some(Duration::from_secs(12)));
        assert!(!open.is_provider_fault());
    }

    #[test]
    fn test_retries_exhausted_metadata() {
        let err = FeedError::RetriesExhausted {
            attempts: 3,
            source: Box::new(
                FeedError::http(429, "slow down").with_retry_after(Duration::from_secs(2)),
            ),
        };

        assert_eq!(err.attempts(), Some(3));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert!(err.is_provider_fault());
        assert!(err.to_string().contains("3 attempts"));
    }

    #[test]
    fn test_client_errors_are_not_provider_faults() {
        assert!(!FeedError::http(400, "bad request").is_provider_fault());
        assert!(!FeedError::Validation("x".to_string()).is_provider_fault());
        assert!(FeedError::http(502, "bad gateway").is_provider_fault());
    }
}
