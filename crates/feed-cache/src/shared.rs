//! L2 공유 cache.
//!
//! 항목을 JSON 문자열로 `StateStore`에 저장합니다. 저장소 TTL은 항목이
//! 사용 불가해지는 시점(`stale_until`)에 맞춰 설정됩니다.

use feed_store::SharedStore;
use tracing::debug;

use crate::entry::CacheEntry;
use crate::error::CacheResult;

/// L2 저장소 키 prefix.
const CACHE_PREFIX: &str = "cache:";

/// 저장소 기반 L2 cache.
#[derive(Clone)]
pub struct SharedCache {
    store: SharedStore,
}

impl SharedCache {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    fn store_key(key: &str) -> String {
        format!("{}{}", CACHE_PREFIX, key)
    }

    /// 항목 조회.
    pub async fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        match self.store.get(&Self::store_key(key)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// 항목 저장. 이미 사용 불가한 항목은 저장하지 않습니다.
    pub async fn set(&self, entry: &CacheEntry, now_ms: i64) -> CacheResult<()> {
        let Some(ttl) = entry.remaining_ttl(now_ms) else {
            debug!(cache_key = %entry.key, "만료된 항목은 L2에 저장하지 않음");
            return Ok(());
        };
        let raw = serde_json::to_string(entry)?;
        self.store.set(&Self::store_key(&entry.key), &raw, ttl).await?;
        Ok(())
    }

    /// 항목 삭제.
    pub async fn delete(&self, key: &str) -> CacheResult<bool> {
        Ok(self.store.delete(&Self::store_key(key)).await?)
    }

    /// prefix로 시작하는 항목 삭제.
    pub async fn delete_prefix(&self, prefix: &str) -> CacheResult<usize> {
        Ok(self.store.delete_prefix(&Self::store_key(prefix)).await?)
    }
}
