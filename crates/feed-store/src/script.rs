//! 원자적 스크립트.
//!
//! `StoreScript`는 같은 read-modify-write 로직을 두 가지 형태로 가집니다:
//!
//! - Redis에서 `EVALSHA`로 실행되는 Lua 본문
//! - `MemoryStore`가 자신의 lock을 잡은 상태에서 실행하는 Rust 함수
//!
//! 두 구현은 같은 KEYS/ARGV를 받고 같은 문자열 배열을 반환해야 합니다.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{StoreError, StoreResult};
use crate::memory::{MemoryEntry, MemoryValue};

/// 스크립트 응답 (모든 값은 문자열로 반환).
pub type ScriptReply = Vec<String>;

/// 로컬 실행 함수.
pub type LocalScriptFn = fn(&mut LocalTxn<'_>, &[String], &[String]) -> StoreResult<ScriptReply>;

/// 원자적 스크립트 정의.
#[derive(Clone, Copy)]
pub struct StoreScript {
    name: &'static str,
    lua: &'static str,
    local: LocalScriptFn,
}

impl StoreScript {
    /// 새 스크립트 정의.
    pub const fn new(name: &'static str, lua: &'static str, local: LocalScriptFn) -> Self {
        Self { name, lua, local }
    }

    /// 스크립트 이름 (로그/에러용).
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Lua 본문.
    pub fn lua(&self) -> &'static str {
        self.lua
    }

    pub(crate) fn run_local(
        &self,
        txn: &mut LocalTxn<'_>,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<ScriptReply> {
        (self.local)(txn, keys, args)
    }
}

impl fmt::Debug for StoreScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreScript").field("name", &self.name).finish()
    }
}

/// 인자 파싱.
pub fn parse_arg<T: FromStr>(args: &[String], index: usize, name: &str) -> StoreResult<T> {
    args.get(index)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| StoreError::Script {
            name: name.to_string(),
            message: format!("missing or invalid ARGV[{}]", index + 1),
        })
}

/// 응답 값 파싱.
pub fn parse_reply<T: FromStr>(reply: &[String], index: usize, name: &str) -> StoreResult<T> {
    reply
        .get(index)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| {
            StoreError::InvalidReply(format!("{}: missing or invalid reply[{}]", name, index))
        })
}

/// `MemoryStore` 안에서 실행되는 트랜잭션 뷰.
///
/// 호출 동안 저장소 전체 lock이 유지되므로 모든 연산이 원자적으로 적용됩니다.
/// 만료 판정은 저장소의 시계를 기준으로 합니다.
pub struct LocalTxn<'a> {
    entries: &'a mut HashMap<String, MemoryEntry>,
    now_ms: i64,
}

impl<'a> LocalTxn<'a> {
    pub(crate) fn new(entries: &'a mut HashMap<String, MemoryEntry>, now_ms: i64) -> Self {
        Self { entries, now_ms }
    }

    fn live(&mut self, key: &str) -> Option<&mut MemoryEntry> {
        let expired = self
            .entries
            .get(key)
            .map(|entry| entry.is_expired(self.now_ms))
            .unwrap_or(false);
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    /// 문자열 값 조회.
    pub fn get(&mut self, key: &str) -> Option<String> {
        match self.live(key).map(|entry| &entry.value) {
            Some(MemoryValue::Str(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// 문자열 값 저장.
    pub fn set(&mut self, key: &str, value: impl Into<String>, ttl: Option<Duration>) {
        let expires_at_ms = ttl.map(|ttl| self.now_ms + ttl.as_millis() as i64);
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: MemoryValue::Str(value.into()),
                expires_at_ms,
            },
        );
    }

    /// 만료 시간을 유지한 채 문자열 값 교체.
    pub fn set_keep_ttl(&mut self, key: &str, value: impl Into<String>) {
        let expires_at_ms = self.live(key).and_then(|entry| entry.expires_at_ms);
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: MemoryValue::Str(value.into()),
                expires_at_ms,
            },
        );
    }

    /// 키 존재 여부.
    pub fn exists(&mut self, key: &str) -> bool {
        self.live(key).is_some()
    }

    /// 해시 필드 조회 (`HMGET`).
    pub fn hmget(&mut self, key: &str, fields: &[&str]) -> Vec<Option<String>> {
        match self.live(key).map(|entry| &entry.value) {
            Some(MemoryValue::Hash(map)) => fields.iter().map(|f| map.get(*f).cloned()).collect(),
            _ => vec![None; fields.len()],
        }
    }

    /// 해시 필드 저장 (`HSET`). 기존 만료 시간은 유지됩니다.
    pub fn hset(&mut self, key: &str, fields: &[(&str, String)]) {
        let is_hash = matches!(
            self.live(key).map(|entry| &entry.value),
            Some(MemoryValue::Hash(_))
        );
        if !is_hash {
            self.entries.insert(
                key.to_string(),
                MemoryEntry {
                    value: MemoryValue::Hash(HashMap::new()),
                    expires_at_ms: None,
                },
            );
        }
        if let Some(MemoryEntry {
            value: MemoryValue::Hash(map),
            ..
        }) = self.entries.get_mut(key)
        {
            for (field, value) in fields {
                map.insert((*field).to_string(), value.clone());
            }
        }
    }

    /// 만료 시간 설정 (`PEXPIRE`).
    pub fn pexpire(&mut self, key: &str, ttl: Duration) -> bool {
        let expires_at_ms = self.now_ms + ttl.as_millis() as i64;
        match self.live(key) {
            Some(entry) => {
                entry.expires_at_ms = Some(expires_at_ms);
                true
            }
            None => false,
        }
    }

    /// 키 삭제 (`DEL`).
    pub fn del(&mut self, key: &str) -> bool {
        self.live(key).is_some() && self.entries.remove(key).is_some()
    }
}
