//! Redis 저장소 구현.
//!
//! circuit/rate limit 상태와 L2 cache를 여러 인스턴스가 공유하기 위한 저장소입니다.
//! 모든 명령은 `command_timeout`으로 제한되며, 타임아웃은 저장소 오류로 취급됩니다.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use feed_core::StoreConfig;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisResult, Script};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::script::{ScriptReply, StoreScript};
use crate::traits::{StateStore, StoreBackend};

/// 최초 연결 타임아웃.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// `SCAN` 한 번에 요청할 키 수.
const SCAN_BATCH: usize = 500;

/// 첫 증가 시에만 만료를 거는 `INCR`.
const INCR_WITH_TTL: &str = r#"
local value = redis.call('INCR', KEYS[1])
if value == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return value
"#;

/// Redis 기반 공유 저장소.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    key_prefix: String,
    command_timeout: Duration,
    /// 이름별로 SHA가 계산된 스크립트
    scripts: Arc<DashMap<&'static str, Arc<Script>>>,
    incr_script: Arc<Script>,
}

impl RedisStore {
    /// 새로운 Redis 연결을 생성합니다.
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| StoreError::Config("store.url is not set".to_string()))?;

        info!("Connecting to Redis...");

        let client = Client::open(url)?;
        let connection = tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(format!("connect exceeded {:?}", CONNECT_TIMEOUT)))??;

        info!(key_prefix = %config.key_prefix, "Redis connection established");

        Ok(Self {
            connection,
            key_prefix: config.key_prefix.clone(),
            command_timeout: config.command_timeout(),
            scripts: Arc::new(DashMap::new()),
            incr_script: Arc::new(Script::new(INCR_WITH_TTL)),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn script(&self, def: &StoreScript) -> Arc<Script> {
        self.scripts
            .entry(def.name())
            .or_insert_with(|| Arc::new(Script::new(def.lua())))
            .clone()
    }

    /// 명령을 타임아웃과 함께 실행합니다.
    async fn timed<T, F>(&self, op: &str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(format!(
                "{} exceeded {:?}",
                op, self.command_timeout
            ))),
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// `SCAN MATCH` 패턴용 glob 특수문자 이스케이프.
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl StateStore for RedisStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Redis
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let key = self.full_key(key);
        let mut conn = self.connection.clone();
        self.timed("GET", async move {
            let value: Option<String> = conn.get(&key).await?;
            Ok(value)
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let key = self.full_key(key);
        let mut conn = self.connection.clone();
        self.timed("SET", async move {
            let _: () = redis::cmd("SET")
                .arg(&key)
                .arg(value)
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let key = self.full_key(key);
        let mut conn = self.connection.clone();
        self.timed("SET NX", async move {
            let reply: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query_async(&mut conn)
                .await?;
            Ok(reply.is_some())
        })
        .await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let key = self.full_key(key);
        let mut conn = self.connection.clone();
        self.timed("DEL", async move {
            let deleted: i64 = conn.del(&key).await?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<usize> {
        let pattern = format!("{}*", escape_glob(&self.full_key(prefix)));
        let mut conn = self.connection.clone();
        let mut cursor: u64 = 0;
        let mut deleted = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = self
                .timed("SCAN", async {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn)
                        .await
                })
                .await?;

            if !keys.is_empty() {
                let removed: i64 = self
                    .timed("DEL", async { conn.del(&keys).await })
                    .await?;
                deleted += removed as usize;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(pattern = %pattern, deleted, "prefix 삭제 완료");
        Ok(deleted)
    }

    async fn atomic_incr(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        let key = self.full_key(key);
        let script = self.incr_script.clone();
        let mut conn = self.connection.clone();
        self.timed("INCR", async move {
            let value: i64 = script
                .key(&key)
                .arg(ttl_millis(ttl))
                .invoke_async(&mut conn)
                .await?;
            Ok(value)
        })
        .await
    }

    async fn run_script(
        &self,
        def: &StoreScript,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<ScriptReply> {
        let script = self.script(def);
        let keys: Vec<String> = keys.iter().map(|key| self.full_key(key)).collect();
        let mut conn = self.connection.clone();

        self.timed(def.name(), async move {
            let mut invocation = script.prepare_invoke();
            for key in &keys {
                invocation.key(key);
            }
            for arg in args {
                invocation.arg(arg);
            }
            let reply: Vec<String> = invocation.invoke_async(&mut conn).await?;
            Ok(reply)
        })
        .await
        .map_err(|err| match err {
            StoreError::Command(message) => StoreError::Script {
                name: def.name().to_string(),
                message,
            },
            other => other,
        })
    }

    async fn health_check(&self) -> StoreResult<bool> {
        let mut conn = self.connection.clone();
        let reply: String = self
            .timed("PING", async move { redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        Ok(reply == "PONG")
    }
}
