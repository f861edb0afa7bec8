//! 공유 상태 저장소.
//!
//! 이 crate는 다음을 제공합니다:
//! - `StateStore` trait: TTL, 원자적 증가, 스크립트 트랜잭션을 지원하는 KV 인터페이스
//! - `RedisStore`: Redis 기반 구현 (프로세스 간 조정)
//! - `MemoryStore`: 단일 프로세스 fallback 구현
//! - `StoreScript`: Lua 본문과 동등한 로컬 구현을 묶은 원자적 read-modify-write 단위
//!
//! circuit breaker와 rate limiter의 모든 상태 변경은 `run_script`를 통해서만
//! 이루어집니다. get 후 set 하는 두 단계 갱신은 동시 호출 시 갱신을 잃습니다.

pub mod error;
pub mod memory;
pub mod redis;
pub mod script;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod traits;

use std::sync::Arc;

use feed_core::{SharedClock, StoreConfig};
use tracing::warn;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use self::redis::RedisStore;
pub use script::{parse_arg, parse_reply, LocalTxn, ScriptReply, StoreScript};
pub use traits::{SharedStore, StateStore, StoreBackend};

/// 설정에 맞는 저장소를 생성합니다.
///
/// `url`이 없으면 `MemoryStore`를 사용합니다. 이 경우 상태는 현재 프로세스에만
/// 존재하므로 여러 인스턴스 사이의 circuit/rate limit 조정이 이루어지지 않습니다.
pub async fn connect_store(config: &StoreConfig, clock: SharedClock) -> StoreResult<SharedStore> {
    match &config.url {
        Some(_) => {
            let store = RedisStore::connect(config).await?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("store.url 미설정: 단일 프로세스 메모리 저장소 사용 (인스턴스 간 상태 공유 없음)");
            Ok(Arc::new(MemoryStore::new(clock)))
        }
    }
}
