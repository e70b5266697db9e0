use lazy_static::lazy_static;
use prometheus::{Counter, Gauge, register_counter, register_gauge};


lazy_static! {
    pub static ref LINES_TOTAL: Counter =
        register_counter!("watchdog_log_lines_total", "Total log lines read from the stream").unwrap();
    pub static ref SIGHTINGS_TOTAL: Counter =
        register_counter!("watchdog_sightings_total", "Log lines carrying an IP and an identity").unwrap();
    pub static ref SESSIONS_CREATED: Counter =
        register_counter!("watchdog_sessions_created_total", "Users created on first sighting").unwrap();
    pub static ref IPS_APPENDED: Counter =
        register_counter!("watchdog_ips_appended_total", "New addresses added to existing users").unwrap();
    pub static ref STORE_ERRORS: Counter =
        register_counter!("watchdog_store_errors_total", "Failed storage operations").unwrap();
    pub static ref EVICTION_CANDIDATES: Counter =
        register_counter!("watchdog_eviction_candidates_total", "Idle users queued for eviction").unwrap();
    pub static ref USERS_EVICTED: Counter =
        register_counter!("watchdog_users_evicted_total", "Idle users removed by the reaper").unwrap();
    pub static ref BANS_PURGED: Counter =
        register_counter!("watchdog_bans_purged_total", "Ban records removed after expiry").unwrap();
    pub static ref STREAM_CONNECTED: Gauge =
        register_gauge!("watchdog_stream_connected", "1 while the log stream is connected").unwrap();
}
