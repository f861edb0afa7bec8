//! L1 프로세스 로컬 cache.
//!
//! shard마다 `parking_lot::Mutex<LruCache>`를 두어 lock 경합을 줄입니다.
//! 전체 용량은 shard들에 나누어 배분됩니다.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::entry::CacheEntry;

/// shard LRU cache.
pub struct LocalCache {
    shards: Vec<Mutex<LruCache<String, CacheEntry>>>,
}

impl LocalCache {
    /// 전체 용량과 shard 수로 생성.
    ///
    /// shard 수는 용량을 넘지 않으며, 나머지는 앞쪽 shard에 하나씩 배분되어
    /// shard 용량의 합이 정확히 `capacity`가 됩니다.
    pub fn new(capacity: usize, shards: usize) -> Self {
        let capacity = capacity.max(1);
        let shard_count = shards.clamp(1, capacity);
        let base = capacity / shard_count;
        let remainder = capacity % shard_count;

        Self {
            shards: (0..shard_count)
                .map(|index| {
                    let size = base + usize::from(index < remainder);
                    let size = NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN);
                    Mutex::new(LruCache::new(size))
                })
                .collect(),
        }
    }

    /// 전체 용량 (shard 용량의 합).
    pub fn capacity(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().cap().get()).sum()
    }

    fn shard(&self, key: &str) -> &Mutex<LruCache<String, CacheEntry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }

    /// 항목 조회 (LRU 순서 갱신).
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.shard(key).lock().get(key).cloned()
    }

    /// 항목 저장. 용량을 넘으면 가장 오래 사용하지 않은 항목이 제거됩니다.
    pub fn insert(&self, entry: CacheEntry) {
        self.shard(&entry.key).lock().put(entry.key.clone(), entry);
    }

    /// 항목 제거.
    pub fn remove(&self, key: &str) -> bool {
        self.shard(key).lock().pop(key).is_some()
    }

    /// prefix로 시작하는 항목 제거.
    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let keys: Vec<String> = shard
                .iter()
                .filter(|(key, _)| key.starts_with(prefix))
                .map(|(key, _)| key.clone())
                .collect();
            for key in keys {
                shard.pop(&key);
                removed += 1;
            }
        }
        removed
    }

    /// 전체 항목 수.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 전체 비우기.
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().clear();
        }
    }
}
