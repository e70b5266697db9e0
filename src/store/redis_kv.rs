//! Redis engine for the key-value backend.
//!
//! Each key is a hash holding the payload in `d` and its version in `v`.
//! Versions come from one counter key, so a key that is deleted and written
//! again never reuses a version. The compare steps run as Lua scripts, which
//! Redis executes atomically.

use async_trait::async_trait;
use redis::Script;
use redis::aio::MultiplexedConnection;
use tracing::info;

use super::kv::{KvClient, Versioned};
use crate::error::Result;

pub const DEFAULT_REDIS_URL: &str = "redis://redis:6379";

const VERSION_KEY: &str = "watchdog:version";
const SCAN_COUNT: usize = 200;

// KEYS[1] target, KEYS[2] version counter, ARGV[1] expected version ('' = absent), ARGV[2] payload
const SET_IF_VERSION: &str = r"
local current = redis.call('HGET', KEYS[1], 'v')
if ARGV[1] == '' then
    if current then return 0 end
elseif current ~= ARGV[1] then
    return 0
end
local version = redis.call('INCR', KEYS[2])
redis.call('HSET', KEYS[1], 'v', version, 'd', ARGV[2])
return 1
";

const DELETE_IF_VERSION: &str = r"
if redis.call('HGET', KEYS[1], 'v') == ARGV[1] then
    redis.call('DEL', KEYS[1])
    return 1
end
return 0
";

pub struct RedisKv {
    conn: MultiplexedConnection,
    set_if_version: Script,
    delete_if_version: Script,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(url, "Connected to redis");

        Ok(Self {
            conn,
            set_if_version: Script::new(SET_IF_VERSION),
            delete_if_version: Script::new(DELETE_IF_VERSION),
        })
    }
}

#[async_trait]
impl KvClient for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let mut conn = self.conn.clone();
        let (version, value): (Option<u64>, Option<Vec<u8>>) = redis::cmd("HMGET")
            .arg(key)
            .arg("v")
            .arg("d")
            .query_async(&mut conn)
            .await?;

        Ok(match (version, value) {
            (Some(version), Some(value)) => Some(Versioned { version, value }),
            _ => None,
        })
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let expected = expected.map(|v| v.to_string()).unwrap_or_default();
        let written: i64 = self
            .set_if_version
            .key(key)
            .key(VERSION_KEY)
            .arg(expected)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(written == 1)
    }

    async fn compare_and_delete(&self, key: &str, expected: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .delete_if_version
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    // `prefix` is used as a glob, callers only pass fixed prefixes
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            // Deleted between the scan and the read
            if let Some(stored) = self.get(&key).await? {
                entries.push((key, stored));
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::contract;
    use crate::store::kv::{KvBlocklist, KvSessionStore};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_unreachable_server_is_an_error() {
        let result = RedisKv::connect("redis://127.0.0.1:1").await;
        assert!(matches!(result, Err(Error::Redis(_))));
    }

    #[tokio::test]
    async fn test_bad_url_is_an_error() {
        assert!(RedisKv::connect("not a url").await.is_err());
    }

    // Runs the shared store checks against a live server, e.g.
    // REDIS_TEST_URL=redis://127.0.0.1:6379 cargo test -- --ignored
    #[tokio::test]
    #[ignore = "needs a redis server at REDIS_TEST_URL"]
    async fn test_contract_against_live_server() {
        let url = std::env::var("REDIS_TEST_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let client = Arc::new(RedisKv::connect(&url).await.unwrap());
        let mut conn = client.conn.clone();
        let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await.unwrap();

        let sessions = KvSessionStore::new(client.clone());
        contract::upsert_semantics(&sessions).await;
        let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await.unwrap();
        contract::evict_if_idle(&sessions).await;
        contract::block_and_unblock(&KvBlocklist::new(client)).await;
    }
}
