use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Tracked identity and the addresses it is currently active from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "email")]
    pub identity: String,
    // Max concurrent IPs. Stored only, nothing enforces it.
    pub limit: i64,
    // Most recently added first, never contains duplicates
    pub active_ips: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What an upsert did to the stored user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertOutcome {
    Created,
    Appended,
    Unchanged,
}

impl User {
    pub fn new(identity: &str, ip: &str, limit: i64, now: DateTime<Utc>) -> Self {
        Self {
            identity: identity.to_string(),
            limit,
            active_ips: vec![ip.to_string()],
            created_at: now,
            updated_at: now,
        }
    }

    /// Record a sighting of `ip`. A known address is a no-op and does not
    /// refresh `updated_at`.
    pub fn record_ip(&mut self, ip: &str, now: DateTime<Utc>) -> UpsertOutcome {
        if self.has_ip(ip) {
            return UpsertOutcome::Unchanged;
        }
        self.active_ips.insert(0, ip.to_string());
        self.updated_at = now;
        UpsertOutcome::Appended
    }

    pub fn has_ip(&self, ip: &str) -> bool {
        self.active_ips.iter().any(|known| known == ip)
    }

    /// Idle strictly longer than the window ending at `cutoff`.
    pub fn is_idle_before(&self, cutoff: DateTime<Utc>) -> bool {
        self.updated_at < cutoff
    }
}

/// Merge a sighting into an optional existing user, the shared rule every
/// backend applies inside its own critical section.
pub fn apply_sighting(
    existing: Option<User>,
    identity: &str,
    ip: &str,
    limit: i64,
    now: DateTime<Utc>,
) -> (User, UpsertOutcome) {
    match existing {
        Some(mut user) => {
            let outcome = user.record_ip(ip, now);
            (user, outcome)
        }
        None => (User::new(identity, ip, limit, now), UpsertOutcome::Created),
    }
}

// Ban record for a single address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedIp {
    #[serde(rename = "ip")]
    pub address: String,
    #[serde(rename = "ban_time")]
    pub ban_minutes: i64,
    // Epoch seconds
    pub banned_at: i64,
}

impl BlockedIp {
    pub fn new(address: &str, ban_minutes: i64, now: DateTime<Utc>) -> Self {
        Self {
            address: address.to_string(),
            ban_minutes,
            banned_at: now.timestamp(),
        }
    }

    pub fn expires_at(&self) -> i64 {
        self.banned_at + self.ban_minutes * 60
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() < now.timestamp()
    }
}
