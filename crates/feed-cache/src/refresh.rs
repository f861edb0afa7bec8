//! 백그라운드 갱신 관리.
//!
//! stale 항목의 갱신은 cache key당 하나만 실행되어야 합니다.
//!
//! - 프로세스 내부: `(provider, cache_key)` 단위 registry 슬롯
//! - 클러스터 전체: 저장소 lock (`lock:{cache_key}`, TTL = 갱신 타임아웃)
//! - 실패 후: cooldown 표시 (`cooldown:{cache_key}`)가 만료될 때까지 재시작 금지
//!
//! 동시에 실행되는 갱신 수는 semaphore로 제한되며, 한도를 넘으면 갱신을 건너뜁니다
//! (stale 값은 계속 제공됩니다).

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use feed_core::ProviderKey;
use feed_store::{LocalTxn, ScriptReply, SharedStore, StoreResult, StoreScript};
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// registry 키.
type RefreshKey = (ProviderKey, String);

/// 실행 중인 갱신 작업.
#[derive(Debug)]
struct RefreshHandle {
    id: u64,
    /// 작업 생성 직후 연결됨
    abort: Option<AbortHandle>,
}

/// 갱신 작업 registry.
pub struct RefreshRegistry {
    tasks: Arc<DashMap<RefreshKey, RefreshHandle>>,
    permits: Arc<Semaphore>,
    next_id: AtomicU64,
}

impl RefreshRegistry {
    /// 최대 동시 갱신 수로 생성.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            tasks: Arc::new(DashMap::new()),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            next_id: AtomicU64::new(1),
        }
    }

    /// 갱신 작업을 시작합니다.
    ///
    /// 같은 키의 작업이 이미 실행 중이거나 동시 실행 한도에 도달했으면 `false`.
    pub fn spawn<Fut>(&self, provider: &ProviderKey, cache_key: &str, task: Fut) -> bool
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = (provider.clone(), cache_key.to_string());
        if self.tasks.contains_key(&key) {
            return false;
        }

        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            debug!(
                provider = %provider,
                cache_key,
                "Refresh capacity reached, serving stale value"
            );
            return false;
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match self.tasks.entry(key.clone()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => {
                slot.insert(RefreshHandle { id, abort: None });
            }
        }

        let slot = SlotGuard {
            tasks: self.tasks.clone(),
            key: key.clone(),
            id,
        };
        let handle = tokio::spawn(async move {
            let _slot = slot;
            let _permit = permit;
            task.await;
        });

        match self.tasks.get_mut(&key) {
            Some(mut entry) if entry.id == id => entry.abort = Some(handle.abort_handle()),
            // 연결 전에 취소됨
            _ => handle.abort(),
        }
        true
    }

    /// 해당 cache key의 갱신 작업을 모두 취소합니다.
    pub fn cancel(&self, cache_key: &str) -> usize {
        self.cancel_where(|key| key.1 == cache_key)
    }

    /// prefix로 시작하는 cache key의 갱신 작업을 모두 취소합니다.
    pub fn cancel_prefix(&self, prefix: &str) -> usize {
        self.cancel_where(|key| key.1.starts_with(prefix))
    }

    fn cancel_where(&self, matches: impl Fn(&RefreshKey) -> bool) -> usize {
        let keys: Vec<RefreshKey> = self
            .tasks
            .iter()
            .filter(|entry| matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut cancelled = 0;
        for key in keys {
            if let Some((_, handle)) = self.tasks.remove(&key) {
                if let Some(abort) = handle.abort {
                    abort.abort();
                }
                cancelled += 1;
            }
        }
        cancelled
    }

    /// 실행 중인 갱신 수.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// 갱신 실행 여부.
    pub fn is_refreshing(&self, provider: &ProviderKey, cache_key: &str) -> bool {
        self.tasks
            .contains_key(&(provider.clone(), cache_key.to_string()))
    }
}

impl Drop for RefreshRegistry {
    fn drop(&mut self) {
        for entry in self.tasks.iter() {
            if let Some(abort) = &entry.value().abort {
                abort.abort();
            }
        }
    }
}

/// 작업 종료(완료, 패닉, 취소) 시 registry 슬롯 반환.
struct SlotGuard {
    tasks: Arc<DashMap<RefreshKey, RefreshHandle>>,
    key: RefreshKey,
    id: u64,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let id = self.id;
        self.tasks.remove_if(&self.key, |_, handle| handle.id == id);
    }
}

// ==================== 저장소 lock ====================

/// lock 소유자일 때만 삭제.
const RELEASE_LOCK_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return {tostring(redis.call('DEL', KEYS[1]))}
end
return {'0'}
"#;

fn release_lock_local(
    txn: &mut LocalTxn<'_>,
    keys: &[String],
    args: &[String],
) -> StoreResult<ScriptReply> {
    let owned = match (txn.get(&keys[0]), args.first()) {
        (Some(current), Some(token)) => &current == token,
        _ => false,
    };
    let deleted = owned && txn.del(&keys[0]);
    Ok(vec![if deleted { "1" } else { "0" }.to_string()])
}

static RELEASE_LOCK: StoreScript =
    StoreScript::new("refresh_lock_release", RELEASE_LOCK_LUA, release_lock_local);

pub(crate) fn lock_key(cache_key: &str) -> String {
    format!("lock:{}", cache_key)
}

pub(crate) fn cooldown_key(cache_key: &str) -> String {
    format!("cooldown:{}", cache_key)
}

/// 클러스터 전체 갱신 lock.
///
/// 명시적으로 해제되지 않고 drop되면 (작업 취소 등) 백그라운드에서 해제합니다.
pub(crate) struct RefreshLock {
    store: SharedStore,
    key: String,
    token: String,
    released: bool,
}

impl RefreshLock {
    /// lock 획득 시도. 다른 소유자가 있으면 `None`.
    pub(crate) async fn acquire(
        store: &SharedStore,
        cache_key: &str,
        ttl: Duration,
    ) -> StoreResult<Option<Self>> {
        let key = lock_key(cache_key);
        let token = uuid::Uuid::new_v4().to_string();
        if store.set_nx(&key, &token, ttl).await? {
            Ok(Some(Self {
                store: store.clone(),
                key,
                token,
                released: false,
            }))
        } else {
            Ok(None)
        }
    }

    /// lock 해제.
    pub(crate) async fn release(mut self) {
        self.released = true;
        release(&self.store, &self.key, &self.token).await;
    }
}

impl Drop for RefreshLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let store = self.store.clone();
            let key = std::mem::take(&mut self.key);
            let token = std::mem::take(&mut self.token);
            runtime.spawn(async move { release(&store, &key, &token).await });
        }
    }
}

async fn release(store: &SharedStore, key: &str, token: &str) {
    let keys = vec![key.to_string()];
    let args = vec![token.to_string()];
    if let Err(e) = store.run_script(&RELEASE_LOCK, &keys, &args).await {
        // TTL이 지나면 자동으로 해제됨
        warn!(lock_key = key, error = %e, "Failed to release refresh lock");
    }
}
