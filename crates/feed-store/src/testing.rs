//! 테스트 지원.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{StoreError, StoreResult};
use crate::script::{ScriptReply, StoreScript};
use crate::traits::{StateStore, StoreBackend};

/// 모든 명령이 실패하는 저장소.
///
/// 저장소 장애 시 fail-safe 동작을 검증할 때 사용합니다.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableStore;

fn unavailable<T>() -> StoreResult<T> {
    Err(StoreError::Connection("store unavailable".to_string()))
}

#[async_trait]
impl StateStore for UnavailableStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Redis
    }

    async fn get(&self, _key: &str) -> StoreResult<Option<String>> {
        unavailable()
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> StoreResult<()> {
        unavailable()
    }

    async fn set_nx(&self, _key: &str, _value: &str, _ttl: Duration) -> StoreResult<bool> {
        unavailable()
    }

    async fn delete(&self, _key: &str) -> StoreResult<bool> {
        unavailable()
    }

    async fn delete_prefix(&self, _prefix: &str) -> StoreResult<usize> {
        unavailable()
    }

    async fn atomic_incr(&self, _key: &str, _ttl: Duration) -> StoreResult<i64> {
        unavailable()
    }

    async fn run_script(
        &self,
        _script: &StoreScript,
        _keys: &[String],
        _args: &[String],
    ) -> StoreResult<ScriptReply> {
        Err(StoreError::Timeout("store unavailable".to_string()))
    }

    async fn health_check(&self) -> StoreResult<bool> {
        Ok(false)
    }
}
