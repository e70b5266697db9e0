//! SQLite backend.
//!
//! One connection behind a mutex, so every statement is serialized. Upserts
//! run in an immediate transaction, which keeps them correct even if another
//! process opens the same database file.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::debug;

use super::{IpBlocklist, SessionStore};
use crate::error::Result;
use crate::models::{BlockedIp, UpsertOutcome, User, apply_sighting};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    email       TEXT PRIMARY KEY,
    ip_limit    INTEGER NOT NULL,
    active_ips  TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS blocked_ips (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    ip          TEXT NOT NULL,
    ban_time    INTEGER NOT NULL,
    banned_at   INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_blocked_ips_ip ON blocked_ips(ip);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        debug!(path = %path.display(), "Opened SQLite store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

// Timestamps are stored as RFC 3339 with nanoseconds so they round-trip exactly
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let ips: String = row.get(2)?;
    let active_ips = serde_json::from_str(&ips).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(User {
        identity: row.get(0)?,
        limit: row.get(1)?,
        active_ips,
        created_at: parse_ts(3, &row.get::<_, String>(3)?)?,
        updated_at: parse_ts(4, &row.get::<_, String>(4)?)?,
    })
}

const SELECT_USER: &str =
    "SELECT email, ip_limit, active_ips, created_at, updated_at FROM users WHERE email = ?1";

#[async_trait]
impl SessionStore for SqliteStore {
    async fn get(&self, identity: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(SELECT_USER, params![identity], row_to_user)
            .optional()?)
    }

    async fn record_at(
        &self,
        identity: &str,
        ip: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<(User, UpsertOutcome)> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = tx
            .query_row(SELECT_USER, params![identity], row_to_user)
            .optional()?;
        let (user, outcome) = apply_sighting(existing, identity, ip, limit, now);

        if outcome != UpsertOutcome::Unchanged {
            tx.execute(
                "INSERT INTO users (email, ip_limit, active_ips, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(email) DO UPDATE SET
                    active_ips = excluded.active_ips,
                    updated_at = excluded.updated_at",
                params![
                    user.identity,
                    user.limit,
                    serde_json::to_string(&user.active_ips)?,
                    fmt_ts(user.created_at),
                    fmt_ts(user.updated_at),
                ],
            )?;
        }
        tx.commit()?;
        Ok((user, outcome))
    }

    async fn list(&self) -> Result<Vec<User>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT email, ip_limit, active_ips, created_at, updated_at FROM users ORDER BY email",
        )?;
        let users = stmt
            .query_map([], row_to_user)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(users)
    }

    async fn delete(&self, identity: &str) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM users WHERE email = ?1", params![identity])?;
        Ok(())
    }

    async fn evict_if_idle(&self, identity: &str, cutoff: DateTime<Utc>) -> Result<bool> {
        // Fixed-width RFC 3339 in UTC compares correctly as text
        let removed = self.conn.lock().execute(
            "DELETE FROM users WHERE email = ?1 AND updated_at < ?2",
            params![identity, fmt_ts(cutoff)],
        )?;
        Ok(removed > 0)
    }
}

#[async_trait]
impl IpBlocklist for SqliteStore {
    async fn block(&self, address: &str, ban_minutes: i64) -> Result<BlockedIp> {
        let record = BlockedIp::new(address, ban_minutes, Utc::now());
        self.conn.lock().execute(
            "INSERT INTO blocked_ips (ip, ban_time, banned_at) VALUES (?1, ?2, ?3)",
            params![record.address, record.ban_minutes, record.banned_at],
        )?;
        Ok(record)
    }

    async fn unblock(&self, address: &str) -> Result<bool> {
        let removed = self.conn.lock().execute(
            "DELETE FROM blocked_ips WHERE id = (SELECT MIN(id) FROM blocked_ips WHERE ip = ?1)",
            params![address],
        )?;
        Ok(removed > 0)
    }

    async fn list(&self) -> Result<Vec<BlockedIp>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT ip, ban_time, banned_at FROM blocked_ips ORDER BY id")?;
        let records = stmt
            .query_map([], |row| {
                Ok(BlockedIp {
                    address: row.get(0)?,
                    ban_minutes: row.get(1)?,
                    banned_at: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let purged = self.conn.lock().execute(
            "DELETE FROM blocked_ips WHERE banned_at + ban_time * 60 < ?1",
            params![now.timestamp()],
        )?;
        Ok(purged)
    }
}
