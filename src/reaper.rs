//! Inactivity sweep.
//!
//! The reaper lists every user on a fixed interval and queues identities
//! idle longer than the inactivity delay. A separate eviction worker drains
//! the bounded queue and deletes each identity, re-checking idleness
//! atomically so a user refreshed after detection survives.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::{BANS_PURGED, EVICTION_CANDIDATES, STORE_ERRORS, USERS_EVICTED};
use crate::models::User;
use crate::store::{SessionStore, Stores};

pub const DEFAULT_QUEUE_CAPACITY: usize = 5;

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub sweep_interval: Duration,
    pub inactivity_delay: TimeDelta,
    pub queue_capacity: usize,
    // Also drop ban records whose duration has elapsed
    pub expire_bans: bool,
}

/// Counts from a single sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub users_checked: usize,
    pub queued: usize,
    pub bans_purged: usize,
}

/// Identities whose last update is strictly more than `delay` before `now`.
pub fn find_idle(users: &[User], now: DateTime<Utc>, delay: TimeDelta) -> Vec<String> {
    users
        .iter()
        .filter(|user| now.signed_duration_since(user.updated_at) > delay)
        .map(|user| user.identity.clone())
        .collect()
}

/// One pass: queue idle identities, then purge expired bans if enabled.
///
/// Blocks while the queue is full. Returns early on cancellation or when the
/// eviction worker has gone away.
pub async fn sweep(
    stores: &Stores,
    config: &ReaperConfig,
    queue: &mpsc::Sender<String>,
    cancel: &CancellationToken,
) -> SweepReport {
    let mut report = SweepReport::default();

    let users = match stores.sessions.list().await {
        Ok(users) => users,
        Err(e) => {
            STORE_ERRORS.inc();
            warn!(error = %e, "Reaper failed to list users");
            return report;
        }
    };
    report.users_checked = users.len();

    for identity in find_idle(&users, Utc::now(), config.inactivity_delay) {
        EVICTION_CANDIDATES.inc();
        debug!(identity = %identity, "User is scheduled for deletion");
        tokio::select! {
            sent = queue.send(identity) => {
                if sent.is_err() {
                    warn!("Eviction queue closed, stopping sweep");
                    return report;
                }
                report.queued += 1;
            }
            _ = cancel.cancelled() => return report,
        }
    }

    if config.expire_bans {
        match stores.blocklist.purge_expired(Utc::now()).await {
            Ok(purged) => {
                if purged > 0 {
                    BANS_PURGED.inc_by(purged as f64);
                    info!(purged, "Purged expired bans");
                }
                report.bans_purged = purged;
            }
            Err(e) => {
                STORE_ERRORS.inc();
                warn!(error = %e, "Reaper failed to purge expired bans");
            }
        }
    }

    report
}

/// Sweep loop - runs every `sweep_interval` until cancelled.
pub async fn expiry_reaper(
    stores: Stores,
    config: ReaperConfig,
    queue: mpsc::Sender<String>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        interval = ?config.sweep_interval,
        inactivity_secs = config.inactivity_delay.num_seconds(),
        "Expiry reaper started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => break,
        }

        let report = sweep(&stores, &config, &queue, &cancel).await;
        debug!(
            checked = report.users_checked,
            queued = report.queued,
            "Sweep finished"
        );
    }

    info!("Expiry reaper stopped");
}

/// Drain the queue, evicting each identity that is still idle.
pub async fn eviction_worker(
    sessions: Arc<dyn SessionStore>,
    mut queue: mpsc::Receiver<String>,
    inactivity_delay: TimeDelta,
    cancel: CancellationToken,
) {
    info!("Eviction worker started");

    loop {
        let identity = tokio::select! {
            next = queue.recv() => match next {
                Some(identity) => identity,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        let cutoff = Utc::now() - inactivity_delay;
        match sessions.evict_if_idle(&identity, cutoff).await {
            Ok(true) => {
                USERS_EVICTED.inc();
                info!(identity = %identity, "Evicted idle user");
            }
            Ok(false) => {
                debug!(identity = %identity, "User refreshed or already gone, skipping");
            }
            Err(e) => {
                STORE_ERRORS.inc();
                warn!(identity = %identity, error = %e, "Failed to evict user");
            }
        }
    }

    info!("Eviction worker stopped");
}
