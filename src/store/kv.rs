//! Key-value backend.
//!
//! Each user is one JSON value under `user:<identity>`, the blocklist is one
//! JSON list under `blocked_ips`. Every value carries a version, and writes
//! are compare-and-swap on that version: read, merge locally, write only if
//! nobody wrote in between, otherwise re-read and merge again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{IpBlocklist, SessionStore};
use crate::error::{Error, Result};
use crate::models::{BlockedIp, UpsertOutcome, User, apply_sighting};

const USER_PREFIX: &str = "user:";
const BLOCKLIST_KEY: &str = "blocked_ips";
const MAX_CAS_ATTEMPTS: usize = 16;

/// A stored value and the version it was written at.
#[derive(Debug, Clone)]
pub struct Versioned {
    pub version: u64,
    pub value: Vec<u8>,
}

/// Minimal versioned key-value client.
///
/// [`MemoryKv`] is the in-process engine,
/// [`RedisKv`](super::redis_kv::RedisKv) the networked one.
#[async_trait]
pub trait KvClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Versioned>>;

    /// Write `value` if the key is still at `expected` (`None` means the key
    /// must be absent). Returns `false` when someone else wrote first.
    async fn compare_and_set(&self, key: &str, expected: Option<u64>, value: Vec<u8>)
    -> Result<bool>;

    /// Delete the key if it is still at `expected`.
    async fn compare_and_delete(&self, key: &str, expected: u64) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>>;
}

#[derive(Default)]
pub struct MemoryKv {
    entries: DashMap<String, Versioned>,
    // Global so a deleted-then-recreated key never reuses a version
    next_version: AtomicU64,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[async_trait]
impl KvClient for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
    ) -> Result<bool> {
        let written = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if expected == Some(occupied.get().version) {
                    let version = self.bump();
                    occupied.insert(Versioned { version, value });
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                if expected.is_none() {
                    let version = self.bump();
                    vacant.insert(Versioned { version, value });
                    true
                } else {
                    false
                }
            }
        };
        Ok(written)
    }

    async fn compare_and_delete(&self, key: &str, expected: u64) -> Result<bool> {
        Ok(self
            .entries
            .remove_if(key, |_, current| current.version == expected)
            .is_some())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect())
    }
}

enum Change<T> {
    Put(T),
    Remove,
    Keep,
}

/// Read-merge-write loop on one key, retried while the version moves under us.
async fn cas_update<C, T, R, F>(client: &C, key: &str, mut apply: F) -> Result<R>
where
    C: KvClient + ?Sized,
    T: Serialize + DeserializeOwned + Send,
    R: Send,
    F: FnMut(Option<T>) -> (Change<T>, R) + Send,
{
    for attempt in 1..=MAX_CAS_ATTEMPTS {
        let current = client.get(key).await?;
        let version = current.as_ref().map(|v| v.version);
        let decoded = match &current {
            Some(stored) => Some(serde_json::from_slice(&stored.value)?),
            None => None,
        };

        let (change, result) = apply(decoded);
        let committed = match change {
            Change::Keep => true,
            Change::Put(value) => {
                client
                    .compare_and_set(key, version, serde_json::to_vec(&value)?)
                    .await?
            }
            Change::Remove => match version {
                Some(version) => client.compare_and_delete(key, version).await?,
                None => true,
            },
        };

        if committed {
            return Ok(result);
        }
        debug!(key, attempt, "Versioned write lost a race, retrying");
    }

    Err(Error::Conflict {
        key: key.to_string(),
        attempts: MAX_CAS_ATTEMPTS,
    })
}

fn user_key(identity: &str) -> String {
    format!("{USER_PREFIX}{identity}")
}

pub struct KvSessionStore<C: ?Sized> {
    client: Arc<C>,
}

impl<C: KvClient + ?Sized> KvSessionStore<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C: KvClient + ?Sized> SessionStore for KvSessionStore<C> {
    async fn get(&self, identity: &str) -> Result<Option<User>> {
        match self.client.get(&user_key(identity)).await? {
            Some(stored) => Ok(Some(serde_json::from_slice(&stored.value)?)),
            None => Ok(None),
        }
    }

    async fn record_at(
        &self,
        identity: &str,
        ip: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<(User, UpsertOutcome)> {
        cas_update(self.client.as_ref(), &user_key(identity), |existing| {
            let (user, outcome) = apply_sighting(existing, identity, ip, limit, now);
            match outcome {
                UpsertOutcome::Unchanged => (Change::Keep, (user, outcome)),
                _ => (Change::Put(user.clone()), (user, outcome)),
            }
        })
        .await
    }

    async fn list(&self) -> Result<Vec<User>> {
        self.client
            .scan_prefix(USER_PREFIX)
            .await?
            .into_iter()
            .map(|(_, stored)| serde_json::from_slice::<User>(&stored.value).map_err(Error::from))
            .collect()
    }

    async fn delete(&self, identity: &str) -> Result<()> {
        self.client.delete(&user_key(identity)).await
    }

    async fn evict_if_idle(&self, identity: &str, cutoff: DateTime<Utc>) -> Result<bool> {
        cas_update(self.client.as_ref(), &user_key(identity), |existing: Option<User>| {
            match existing {
                Some(user) if user.is_idle_before(cutoff) => (Change::Remove, true),
                _ => (Change::Keep, false),
            }
        })
        .await
    }
}

pub struct KvBlocklist<C: ?Sized> {
    client: Arc<C>,
}

impl<C: KvClient + ?Sized> KvBlocklist<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C: KvClient + ?Sized> IpBlocklist for KvBlocklist<C> {
    async fn block(&self, address: &str, ban_minutes: i64) -> Result<BlockedIp> {
        let record = BlockedIp::new(address, ban_minutes, Utc::now());
        cas_update(self.client.as_ref(), BLOCKLIST_KEY, |existing: Option<Vec<BlockedIp>>| {
            let mut records = existing.unwrap_or_default();
            records.push(record.clone());
            (Change::Put(records), ())
        })
        .await?;
        Ok(record)
    }

    async fn unblock(&self, address: &str) -> Result<bool> {
        cas_update(self.client.as_ref(), BLOCKLIST_KEY, |existing: Option<Vec<BlockedIp>>| {
            let mut records = existing.unwrap_or_default();
            match records.iter().position(|r| r.address == address) {
                Some(idx) => {
                    records.remove(idx);
                    (Change::Put(records), true)
                }
                None => (Change::Keep, false),
            }
        })
        .await
    }

    async fn list(&self) -> Result<Vec<BlockedIp>> {
        match self.client.get(BLOCKLIST_KEY).await? {
            Some(stored) => Ok(serde_json::from_slice(&stored.value)?),
            None => Ok(Vec::new()),
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        cas_update(self.client.as_ref(), BLOCKLIST_KEY, |existing: Option<Vec<BlockedIp>>| {
            let mut records = existing.unwrap_or_default();
            let before = records.len();
            records.retain(|r| !r.is_expired(now));
            let purged = before - records.len();
            if purged == 0 {
                (Change::Keep, 0)
            } else {
                (Change::Put(records), purged)
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;
    use parking_lot::Mutex;

    fn session_store() -> KvSessionStore<MemoryKv> {
        KvSessionStore::new(Arc::new(MemoryKv::new()))
    }

    #[tokio::test]
    async fn test_upsert_semantics() {
        contract::upsert_semantics(&session_store()).await;
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        contract::list_and_delete(&session_store()).await;
    }

    #[tokio::test]
    async fn test_evict_if_idle() {
        contract::evict_if_idle(&session_store()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_upserts() {
        contract::concurrent_upserts(Arc::new(session_store())).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_identity_upserts_lose_nothing() {
        let store = Arc::new(session_store());
        let mut tasks = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.upsert("shared@x.com", &format!("10.1.0.{i}"), 1).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let user = store.get("shared@x.com").await.unwrap().unwrap();
        assert_eq!(user.active_ips.len(), 32);
    }

    #[tokio::test]
    async fn test_block_and_unblock() {
        contract::block_and_unblock(&KvBlocklist::new(Arc::new(MemoryKv::new()))).await;
    }

    #[tokio::test]
    async fn test_purge_expired() {
        contract::purge_expired(&KvBlocklist::new(Arc::new(MemoryKv::new()))).await;
    }

    #[tokio::test]
    async fn test_cas_rejects_stale_version() {
        let kv = MemoryKv::new();
        assert!(kv.compare_and_set("k", None, b"a".to_vec()).await.unwrap());
        let v1 = kv.get("k").await.unwrap().unwrap().version;

        assert!(!kv.compare_and_set("k", None, b"b".to_vec()).await.unwrap());
        assert!(kv.compare_and_set("k", Some(v1), b"b".to_vec()).await.unwrap());
        assert!(!kv.compare_and_set("k", Some(v1), b"c".to_vec()).await.unwrap());
        assert!(!kv.compare_and_delete("k", v1).await.unwrap());

        // Recreated keys never reuse an old version
        kv.delete("k").await.unwrap();
        assert!(kv.compare_and_set("k", None, b"d".to_vec()).await.unwrap());
        assert_ne!(kv.get("k").await.unwrap().unwrap().version, v1);
    }

    /// Lets one competing write land between our read and our write.
    struct InterleavingKv {
        inner: MemoryKv,
        competing: Mutex<Option<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl KvClient for InterleavingKv {
        async fn get(&self, key: &str) -> Result<Option<Versioned>> {
            self.inner.get(key).await
        }

        async fn compare_and_set(
            &self,
            key: &str,
            expected: Option<u64>,
            value: Vec<u8>,
        ) -> Result<bool> {
            let competing = self.competing.lock().take();
            if let Some((other_key, other_value)) = competing {
                let current = self.inner.get(&other_key).await?.map(|v| v.version);
                assert!(
                    self.inner
                        .compare_and_set(&other_key, current, other_value)
                        .await?
                );
            }
            self.inner.compare_and_set(key, expected, value).await
        }

        async fn compare_and_delete(&self, key: &str, expected: u64) -> Result<bool> {
            self.inner.compare_and_delete(key, expected).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }

        async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
            self.inner.scan_prefix(prefix).await
        }
    }

    #[tokio::test]
    async fn test_interleaved_write_is_merged_not_lost() {
        let client = Arc::new(InterleavingKv {
            inner: MemoryKv::new(),
            competing: Mutex::new(None),
        });
        let store = KvSessionStore::new(client.clone());
        store
            .upsert_at("a@b.com", "1.1.1.1", 1, contract::t0())
            .await
            .unwrap();

        // Another writer appends 6.6.6.6 after we read but before we write
        let mut other = store.get("a@b.com").await.unwrap().unwrap();
        other.record_ip("6.6.6.6", contract::t0());
        *client.competing.lock() =
            Some((user_key("a@b.com"), serde_json::to_vec(&other).unwrap()));

        let outcome = store
            .upsert_at("a@b.com", "2.2.2.2", 1, contract::t0())
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Appended);

        let user = store.get("a@b.com").await.unwrap().unwrap();
        assert_eq!(user.active_ips, vec!["2.2.2.2", "6.6.6.6", "1.1.1.1"]);
    }
}
