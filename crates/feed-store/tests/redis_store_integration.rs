//! Integration tests for RedisStore against a live server.
//!
//! Set `FEED_TEST_REDIS_URL` (e.g. redis://localhost:6379/15) to run them.

use std::time::Duration;

use feed_core::StoreConfig;
use feed_store::{parse_arg, LocalTxn, RedisStore, ScriptReply, StateStore, StoreResult, StoreScript};

fn redis_config() -> Option<StoreConfig> {
    let url = std::env::var("FEED_TEST_REDIS_URL").ok()?;
    Some(StoreConfig {
        url: Some(url),
        key_prefix: format!("feed-test:{}:", std::process::id()),
        command_timeout_ms: 2_000,
        ..Default::default()
    })
}

fn add_local(txn: &mut LocalTxn<'_>, keys: &[String], args: &[String]) -> StoreResult<ScriptReply> {
    let step: i64 = parse_arg(args, 0, "test_add")?;
    let current = txn.get(&keys[0]).and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
    txn.set_keep_ttl(&keys[0], (current + step).to_string());
    Ok(vec![(current + step).to_string()])
}

static ADD: StoreScript = StoreScript::new(
    "test_add",
    r#"
local next = (tonumber(redis.call('GET', KEYS[1])) or 0) + tonumber(ARGV[1])
redis.call('SET', KEYS[1], next)
return {tostring(next)}
"#,
    add_local,
);

#[tokio::test]
async fn test_redis_store_roundtrip() {
    let Some(config) = redis_config() else {
        eprintln!("Skipping test: FEED_TEST_REDIS_URL not set");
        return;
    };

    let store = RedisStore::connect(&config).await.expect("Failed to connect");
    assert!(store.health_check().await.unwrap());

    store.set("k", "v", Duration::from_secs(30)).await.unwrap();
    assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

    assert!(store.set_nx("lock", "a", Duration::from_secs(30)).await.unwrap());
    assert!(!store.set_nx("lock", "b", Duration::from_secs(30)).await.unwrap());

    assert_eq!(store.atomic_incr("n", Duration::from_secs(30)).await.unwrap(), 1);
    assert_eq!(store.atomic_incr("n", Duration::from_secs(30)).await.unwrap(), 2);

    let keys = vec!["sum".to_string()];
    store.run_script(&ADD, &keys, &["5".to_string()]).await.unwrap();
    let reply = store.run_script(&ADD, &keys, &["2".to_string()]).await.unwrap();
    assert_eq!(reply, vec!["7".to_string()]);

    let removed = store.delete_prefix("").await.unwrap();
    assert!(removed >= 4);
    assert_eq!(store.get("k").await.unwrap(), None);
}
