//! JSON-file backend.
//!
//! State lives in memory and every mutation rewrites the whole file. Reads
//! go straight to a sharded map. Mutations take the write lock, change the
//! map, then write a snapshot of it; if the write fails the change is rolled
//! back before the lock is released, so memory never runs ahead of the file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, trace, warn};

use super::{IpBlocklist, SessionStore};
use crate::error::Result;
use crate::models::{BlockedIp, UpsertOutcome, User, apply_sighting};

pub struct FileSessionStore {
    path: PathBuf,
    users: DashMap<String, User>,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileSessionStore {
    /// Load `path` if it exists, otherwise start empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let users = DashMap::new();
        for user in load_records::<User>(&path)? {
            users.insert(user.identity.clone(), user);
        }
        debug!(path = %path.display(), users = users.len(), "Loaded user file");

        Ok(Self {
            path,
            users,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    // Caller holds `write_lock`. On failure `identity` goes back to `previous`.
    async fn persist(&self, identity: &str, previous: Option<User>) -> Result<()> {
        let mut snapshot: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        snapshot.sort_by(|a, b| a.identity.cmp(&b.identity));

        if let Err(e) = write_records(&self.path, &snapshot).await {
            warn!(identity, error = %e, "User file write failed, rolling back");
            match previous {
                Some(user) => {
                    self.users.insert(identity.to_string(), user);
                }
                None => {
                    self.users.remove(identity);
                }
            }
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn get(&self, identity: &str) -> Result<Option<User>> {
        Ok(self.users.get(identity).map(|u| u.value().clone()))
    }

    async fn record_at(
        &self,
        identity: &str,
        ip: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<(User, UpsertOutcome)> {
        let _guard = self.write_lock.lock().await;
        let previous = self.users.get(identity).map(|u| u.value().clone());
        let (user, outcome) = apply_sighting(previous.clone(), identity, ip, limit, now);

        if outcome != UpsertOutcome::Unchanged {
            self.users.insert(identity.to_string(), user.clone());
            self.persist(identity, previous).await?;
        }
        Ok((user, outcome))
    }

    async fn list(&self) -> Result<Vec<User>> {
        Ok(self.users.iter().map(|e| e.value().clone()).collect())
    }

    async fn delete(&self, identity: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if let Some((_, removed)) = self.users.remove(identity) {
            self.persist(identity, Some(removed)).await?;
        }
        Ok(())
    }

    async fn evict_if_idle(&self, identity: &str, cutoff: DateTime<Utc>) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        match self
            .users
            .remove_if(identity, |_, user| user.is_idle_before(cutoff))
        {
            Some((_, removed)) => {
                self.persist(identity, Some(removed)).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

pub struct FileBlocklist {
    path: PathBuf,
    records: Mutex<Vec<BlockedIp>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileBlocklist {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = load_records::<BlockedIp>(&path)?;
        debug!(path = %path.display(), records = records.len(), "Loaded blocklist file");

        Ok(Self {
            path,
            records: Mutex::new(records),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    // Caller holds `write_lock`. On failure the list goes back to `previous`.
    async fn persist(&self, previous: Vec<BlockedIp>) -> Result<()> {
        let snapshot = self.records.lock().clone();
        if let Err(e) = write_records(&self.path, &snapshot).await {
            warn!(error = %e, "Blocklist file write failed, rolling back");
            *self.records.lock() = previous;
            return Err(e);
        }
        Ok(())
    }

    // Apply `change` under the write lock and persist it if it changed anything
    async fn mutate<R, F>(&self, change: F) -> Result<R>
    where
        R: Send,
        F: FnOnce(&mut Vec<BlockedIp>) -> (bool, R) + Send,
    {
        let _guard = self.write_lock.lock().await;
        let (previous, changed, result) = {
            let mut records = self.records.lock();
            let previous = records.clone();
            let (changed, result) = change(&mut records);
            (previous, changed, result)
        };
        if changed {
            self.persist(previous).await?;
        }
        Ok(result)
    }
}

#[async_trait]
impl IpBlocklist for FileBlocklist {
    async fn block(&self, address: &str, ban_minutes: i64) -> Result<BlockedIp> {
        let record = BlockedIp::new(address, ban_minutes, Utc::now());
        self.mutate(|records| {
            records.push(record.clone());
            (true, ())
        })
        .await?;
        Ok(record)
    }

    async fn unblock(&self, address: &str) -> Result<bool> {
        self.mutate(|records| match records.iter().position(|r| r.address == address) {
            Some(idx) => {
                records.remove(idx);
                (true, true)
            }
            None => (false, false),
        })
        .await
    }

    async fn list(&self) -> Result<Vec<BlockedIp>> {
        Ok(self.records.lock().clone())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.mutate(|records| {
            let before = records.len();
            records.retain(|r| !r.is_expired(now));
            let purged = before - records.len();
            (purged > 0, purged)
        })
        .await
    }
}

fn load_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    if data.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(&data)?)
}

// Write to a sibling temp file, then rename over the target
async fn write_records<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    let data = serde_json::to_vec(records)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &data).await?;
    tokio::fs::rename(&tmp, path).await?;
    trace!(path = %path.display(), bytes = data.len(), "Flushed storage file");
    Ok(())
}
