//! 저장소 오류 타입.

use feed_core::FeedError;
use thiserror::Error;

/// 저장소 관련 오류.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// 연결 실패 또는 끊김
    #[error("Store connection error: {0}")]
    Connection(String),

    /// 명령 실행 오류
    #[error("Store command error: {0}")]
    Command(String),

    /// 명령 타임아웃
    #[error("Store timeout: {0}")]
    Timeout(String),

    /// 스크립트 실행 오류
    #[error("Script '{name}' failed: {message}")]
    Script { name: String, message: String },

    /// 예상하지 못한 응답 형식
    #[error("Invalid store reply: {0}")]
    InvalidReply(String),

    /// 잘못된 설정
    #[error("Store configuration error: {0}")]
    Config(String),
}

/// 저장소 작업을 위한 Result 타입.
pub type StoreResult<T> = Result<T, StoreError>;

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() {
            StoreError::Connection(err.to_string())
        } else if err.is_timeout() {
            StoreError::Timeout(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

impl From<StoreError> for FeedError {
    fn from(err: StoreError) -> Self {
        FeedError::Store(err.to_string())
    }
}
