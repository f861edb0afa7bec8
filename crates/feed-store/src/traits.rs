//! 저장소 인터페이스.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::script::{ScriptReply, StoreScript};

/// 저장소 구현 종류.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Redis 호환 서버 (프로세스 간 공유)
    Redis,
    /// 프로세스 로컬 메모리 (단일 프로세스 전용)
    Memory,
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreBackend::Redis => write!(f, "redis"),
            StoreBackend::Memory => write!(f, "memory"),
        }
    }
}

/// 공유 상태 저장소.
///
/// 키는 논리 키(`cb:yahoo`, `cache:quotes:AAPL` 등)로 전달되며,
/// 구현체가 필요한 prefix를 붙입니다.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// 구현 종류.
    fn backend(&self) -> StoreBackend;

    /// 문자열 값 조회.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// TTL과 함께 값 저장.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// 키가 없을 때만 저장 (lock 획득용). 저장했으면 `true`.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// 키 삭제. 삭제된 키가 있었으면 `true`.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// prefix로 시작하는 모든 키 삭제.
    async fn delete_prefix(&self, prefix: &str) -> StoreResult<usize>;

    /// 원자적 증가. 키가 새로 생성되면 `ttl`을 설정합니다.
    async fn atomic_incr(&self, key: &str, ttl: Duration) -> StoreResult<i64>;

    /// 여러 키에 대한 원자적 read-modify-write.
    async fn run_script(
        &self,
        script: &StoreScript,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<ScriptReply>;

    /// 저장소 상태 확인.
    async fn health_check(&self) -> StoreResult<bool>;
}

/// 공유 저장소 핸들.
pub type SharedStore = Arc<dyn StateStore>;
