//! 2단계 stale-while-revalidate cache.
//!
//! 이 crate는 다음을 제공합니다:
//! - `LocalCache`: shard LRU 기반 프로세스 로컬 L1
//! - `SharedCache`: 공유 저장소 기반 L2 (JSON 항목)
//! - `TieredCache`: L1 → L2 조회, fresh/stale 판정, 백그라운드 갱신
//! - `RefreshRegistry`: (provider, cache_key)별 갱신 중복 제거와 취소
//!
//! Cache 키는 `{namespace}:{rest}` 형식이며 namespace 단위로 삭제할 수 있습니다.

pub mod entry;
pub mod error;
pub mod local;
pub mod refresh;
pub mod shared;
pub mod tiered;

pub use entry::{CacheEntry, CacheLookup, Freshness};
pub use error::{CacheError, CacheResult};
pub use local::LocalCache;
pub use refresh::RefreshRegistry;
pub use shared::SharedCache;
pub use tiered::{CacheStats, TieredCache};
