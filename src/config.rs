use std::path::PathBuf;
use std::time::Duration;

use chrono::TimeDelta;
use clap::Parser;

use crate::log_stream::StreamConfig;
use crate::reaper::{DEFAULT_QUEUE_CAPACITY, ReaperConfig};
use crate::store::redis_kv::DEFAULT_REDIS_URL;
use crate::store::{StorageKind, StorageLocation};

// Upper bound for second-valued delays, keeps them inside chrono and tokio ranges
const MAX_DELAY_SECS: u64 = 10 * 365 * 24 * 60 * 60;

// CLI argument structure, every flag can also come from the environment
#[derive(Parser, Debug, Clone)]
#[command(name = "session-watchdog")]
#[command(about = "Tracks active source IPs per user from a live log stream")]
pub struct Args {
    // Port for the admin API
    #[arg(short, long, env = "API_PORT", default_value_t = 4000)]
    pub port: u16,

    // Storage backend: json, sqlite, redis or kv (in-process)
    #[arg(long, env = "STORAGE_TYPE", value_enum)]
    pub storage: StorageKind,

    // Directory for users.json / blocked_ips.json (and the default sqlite file)
    #[arg(long, env = "STORAGE_DIR", default_value = "storage")]
    pub storage_dir: PathBuf,

    #[arg(long, env = "SQLITE_PATH")]
    pub sqlite_path: Option<PathBuf>,

    #[arg(long, env = "REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,

    // Seconds without a new IP before a user is evicted
    #[arg(
        long,
        env = "USER_DELETE_DELAY",
        default_value_t = 300,
        value_parser = clap::value_parser!(u64).range(..=MAX_DELAY_SECS)
    )]
    pub user_delete_delay: u64,

    // Seconds between reaper sweeps
    #[arg(
        long,
        env = "SLEEP_DURATION",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(..=MAX_DELAY_SECS)
    )]
    pub sleep_duration: u64,

    #[arg(long, env = "EVICTION_QUEUE_SIZE", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub eviction_queue_size: usize,

    // Limit recorded on new users (not enforced)
    #[arg(long, env = "MAX_ALLOW_USERS", default_value_t = 0)]
    pub max_allow_users: i64,

    // Log server host
    #[arg(long, env = "ADDRESS")]
    pub address: String,

    #[arg(long, env = "PORT_ADDRESS", default_value_t = 8000)]
    pub port_address: u16,

    #[arg(long, env = "P_USER")]
    pub p_user: String,

    #[arg(long, env = "P_PASS", hide_env_values = true)]
    pub p_pass: String,

    // Use wss:// for the log stream
    #[arg(long, env = "SSL", default_value_t = false)]
    pub ssl: bool,

    #[arg(long, env = "LOG_INTERVAL", default_value_t = 5)]
    pub log_interval: u64,

    // Seconds to wait before reconnecting to the log stream
    #[arg(long, env = "RECONNECT_DELAY", default_value_t = 5)]
    pub reconnect_delay: u64,

    // Ban length used when a block request gives none
    #[arg(long, env = "BAN_MINUTES", default_value_t = 10)]
    pub ban_minutes: i64,

    // Let the reaper drop bans whose duration has passed
    #[arg(long, env = "EXPIRE_BANS", default_value_t = false)]
    pub expire_bans: bool,

    #[arg(short, long, env = "VERBOSE", default_value_t = false)]
    pub verbose: bool,
}

impl Args {
    pub fn storage_location(&self) -> StorageLocation {
        StorageLocation {
            dir: self.storage_dir.clone(),
            sqlite_path: self.sqlite_path.clone(),
            redis_url: self.redis_url.clone(),
        }
    }

    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            sweep_interval: Duration::from_secs(self.sleep_duration.max(1)),
            inactivity_delay: TimeDelta::seconds(self.user_delete_delay as i64),
            queue_capacity: self.eviction_queue_size.max(1),
            expire_bans: self.expire_bans,
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            address: self.address.clone(),
            port: self.port_address,
            username: self.p_user.clone(),
            password: self.p_pass.clone(),
            ssl: self.ssl,
            log_interval: self.log_interval,
            reconnect_delay: Duration::from_secs(self.reconnect_delay),
        }
    }
}
