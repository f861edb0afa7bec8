//! Cache 에러 타입.

use feed_core::FeedError;
use feed_store::StoreError;
use thiserror::Error;

/// Cache 내부 에러.
///
/// 조회 경로에서는 호출자에게 전달되지 않고 miss로 처리됩니다.
#[derive(Debug, Error)]
pub enum CacheError {
    /// 저장소 에러
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// 직렬화/역직렬화 에러
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Cache Result 타입.
pub type CacheResult<T> = std::result::Result<T, CacheError>;

impl From<CacheError> for FeedError {
    fn from(err: CacheError) -> Self {
        FeedError::Cache(err.to_string())
    }
}
