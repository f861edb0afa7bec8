//! 프로세스 로컬 메모리 저장소.
//!
//! 공유 저장소가 설정되지 않았을 때만 사용하는 fallback입니다.
//! 모든 연산은 하나의 lock 아래에서 실행되므로 프로세스 내부에서는 원자적이지만,
//! 여러 프로세스/머신 사이의 circuit 및 rate limit 조정은 제공하지 않습니다.
//!
//! 만료된 키는 조회 시점에 걸러지고, 일정 시간 또는 일정 연산 수마다 한꺼번에
//! 정리됩니다. 다시 읽히지 않는 키도 map에 남지 않습니다.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use feed_core::{SharedClock, SystemClock};
use parking_lot::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::script::{LocalTxn, ScriptReply, StoreScript};
use crate::traits::{StateStore, StoreBackend};

/// 저장된 값.
#[derive(Debug, Clone)]
pub(crate) enum MemoryValue {
    Str(String),
    Hash(HashMap<String, String>),
}

/// 만료 시간을 포함한 항목.
#[derive(Debug, Clone)]
pub(crate) struct MemoryEntry {
    pub(crate) value: MemoryValue,
    pub(crate) expires_at_ms: Option<i64>,
}

impl MemoryEntry {
    pub(crate) fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.map(|at| at <= now_ms).unwrap_or(false)
    }
}

/// 만료 항목 정리 주기 (밀리초).
const SWEEP_PERIOD_MS: i64 = 1_000;

/// 정리 사이 최소 연산 수. 항목이 많으면 항목 수의 1/4까지 늘어납니다.
const SWEEP_MIN_OPS: usize = 1_024;

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<String, MemoryEntry>,
    ops_since_sweep: usize,
    last_sweep_ms: i64,
}

impl MemoryState {
    fn maybe_sweep(&mut self, now_ms: i64) {
        self.ops_since_sweep += 1;
        let due_by_ops = self.ops_since_sweep >= SWEEP_MIN_OPS.max(self.entries.len() / 4);
        let due_by_time = now_ms - self.last_sweep_ms >= SWEEP_PERIOD_MS;
        if due_by_ops || due_by_time {
            self.sweep(now_ms);
        }
    }

    fn sweep(&mut self, now_ms: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now_ms));
        self.ops_since_sweep = 0;
        self.last_sweep_ms = now_ms;
        let purged = before - self.entries.len();
        if purged > 0 {
            tracing::trace!(purged, remaining = self.entries.len(), "만료 항목 정리");
        }
        purged
    }
}

/// 단일 프로세스 메모리 저장소.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    clock: SharedClock,
}

impl MemoryStore {
    /// 주어진 시계로 만료를 판정하는 저장소 생성.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            clock,
        }
    }

    /// 시스템 시계를 사용하는 저장소 생성.
    pub fn with_system_clock() -> Self {
        Self::new(SystemClock::shared())
    }

    /// 만료되지 않은 키 수.
    pub fn len(&self) -> usize {
        let now_ms = self.clock.now_ms();
        self.state
            .lock()
            .entries
            .values()
            .filter(|entry| !entry.is_expired(now_ms))
            .count()
    }

    /// 비어 있는지 확인.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 만료 항목을 즉시 정리합니다. 정리된 항목 수를 반환합니다.
    pub fn purge_expired(&self) -> usize {
        let now_ms = self.clock.now_ms();
        self.state.lock().sweep(now_ms)
    }

    fn with_txn<T>(&self, f: impl FnOnce(&mut LocalTxn<'_>) -> T) -> T {
        let now_ms = self.clock.now_ms();
        let mut state = self.state.lock();
        state.maybe_sweep(now_ms);
        let mut txn = LocalTxn::new(&mut state.entries, now_ms);
        f(&mut txn)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Memory
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.with_txn(|txn| txn.get(key)))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.with_txn(|txn| txn.set(key, value, Some(ttl)));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        Ok(self.with_txn(|txn| {
            if txn.exists(key) {
                false
            } else {
                txn.set(key, value, Some(ttl));
                true
            }
        }))
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        Ok(self.with_txn(|txn| txn.del(key)))
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<usize> {
        let now_ms = self.clock.now_ms();
        let mut state = self.state.lock();
        let entries = &mut state.entries;
        let before = entries.len();
        let mut removed_live = 0;
        entries.retain(|key, entry| {
            if key.starts_with(prefix) {
                if !entry.is_expired(now_ms) {
                    removed_live += 1;
                }
                false
            } else {
                true
            }
        });
        tracing::trace!(prefix, removed = before - entries.len(), "prefix 삭제");
        Ok(removed_live)
    }

    async fn atomic_incr(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        self.with_txn(|txn| {
            let current = match txn.get(key) {
                Some(raw) => raw.parse::<i64>().map_err(|_| {
                    StoreError::Command(format!("value at '{}' is not an integer", key))
                })?,
                None if txn.exists(key) => {
                    return Err(StoreError::Command(format!(
                        "value at '{}' is not a string",
                        key
                    )))
                }
                None => 0,
            };
            let next = current + 1;
            if current == 0 {
                txn.set(key, next.to_string(), Some(ttl));
            } else {
                txn.set_keep_ttl(key, next.to_string());
            }
            Ok(next)
        })
    }

    async fn run_script(
        &self,
        script: &StoreScript,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<ScriptReply> {
        self.with_txn(|txn| script.run_local(txn, keys, args))
    }

    async fn health_check(&self) -> StoreResult<bool> {
        Ok(true)
    }
}
