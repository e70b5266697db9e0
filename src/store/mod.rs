//! Session and blocklist storage.
//!
//! [`SessionStore`] and [`IpBlocklist`] are the contracts every backend
//! implements. Three backends ship with the crate:
//!
//! - [`file`]: sharded in-memory map snapshotted to a JSON file
//! - [`sqlite`]: relational tables on a single SQLite connection
//! - [`kv`]: versioned key-value values updated with compare-and-swap,
//!   either in process or on a Redis server ([`redis_kv`])
//!
//! The backend is chosen once at startup by [`open_backend`] and handed to
//! every consumer as a trait object.

pub mod file;
pub mod kv;
pub mod redis_kv;
pub mod sqlite;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use tracing::info;

use crate::error::Result;
use crate::models::{BlockedIp, UpsertOutcome, User};

/// Which engine backs the stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageKind {
    Json,
    Sqlite,
    Redis,
    /// Key-value backend on an in-process engine; nothing survives a restart.
    Kv,
}

/// Who is active from which addresses.
///
/// Mutations on one identity are linearizable with respect to each other.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, identity: &str) -> Result<Option<User>>;

    /// Record a sighting of `ip` for `identity` at `now`, returning the user
    /// as it stands right after this write.
    async fn record_at(
        &self,
        identity: &str,
        ip: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<(User, UpsertOutcome)>;

    async fn record(&self, identity: &str, ip: &str, limit: i64) -> Result<(User, UpsertOutcome)> {
        self.record_at(identity, ip, limit, Utc::now()).await
    }

    async fn upsert_at(
        &self,
        identity: &str,
        ip: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let (_, outcome) = self.record_at(identity, ip, limit, now).await?;
        Ok(outcome)
    }

    async fn upsert(&self, identity: &str, ip: &str, limit: i64) -> Result<UpsertOutcome> {
        self.upsert_at(identity, ip, limit, Utc::now()).await
    }

    async fn list(&self) -> Result<Vec<User>>;

    /// Remove the user. Absent identities are not an error.
    async fn delete(&self, identity: &str) -> Result<()>;

    /// Remove the user only if it was last updated before `cutoff`.
    ///
    /// Returns whether a user was removed.
    async fn evict_if_idle(&self, identity: &str, cutoff: DateTime<Utc>) -> Result<bool>;
}

/// Ban records. Duplicate addresses are allowed.
#[async_trait]
pub trait IpBlocklist: Send + Sync {
    async fn block(&self, address: &str, ban_minutes: i64) -> Result<BlockedIp>;

    /// Remove the first record for `address`, leaving any duplicates.
    async fn unblock(&self, address: &str) -> Result<bool>;

    async fn list(&self) -> Result<Vec<BlockedIp>>;

    /// Drop every record whose ban duration has elapsed at `now`.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// The pair of stores built from one backend selection.
#[derive(Clone)]
pub struct Stores {
    pub sessions: Arc<dyn SessionStore>,
    pub blocklist: Arc<dyn IpBlocklist>,
}

/// Where each backend keeps its state.
#[derive(Debug, Clone)]
pub struct StorageLocation {
    pub dir: PathBuf,
    pub sqlite_path: Option<PathBuf>,
    pub redis_url: String,
}

impl StorageLocation {
    pub fn sqlite_file(&self) -> PathBuf {
        self.sqlite_path
            .clone()
            .unwrap_or_else(|| self.dir.join("watchdog.db"))
    }
}

/// Build the stores for `kind`.
pub async fn open_backend(kind: StorageKind, location: &StorageLocation) -> Result<Stores> {
    let stores = match kind {
        StorageKind::Json => {
            std::fs::create_dir_all(&location.dir)?;
            Stores {
                sessions: Arc::new(file::FileSessionStore::open(
                    location.dir.join("users.json"),
                )?),
                blocklist: Arc::new(file::FileBlocklist::open(
                    location.dir.join("blocked_ips.json"),
                )?),
            }
        }
        StorageKind::Sqlite => {
            let path = location.sqlite_file();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let db = Arc::new(sqlite::SqliteStore::open(&path)?);
            Stores {
                sessions: db.clone(),
                blocklist: db,
            }
        }
        StorageKind::Redis => {
            let client = Arc::new(redis_kv::RedisKv::connect(&location.redis_url).await?);
            Stores {
                sessions: Arc::new(kv::KvSessionStore::new(client.clone())),
                blocklist: Arc::new(kv::KvBlocklist::new(client)),
            }
        }
        StorageKind::Kv => {
            let client = Arc::new(kv::MemoryKv::new());
            Stores {
                sessions: Arc::new(kv::KvSessionStore::new(client.clone())),
                blocklist: Arc::new(kv::KvBlocklist::new(client)),
            }
        }
    };

    info!(backend = ?kind, dir = %location.dir.display(), "Storage backend ready");
    Ok(stores)
}
