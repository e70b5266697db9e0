use std::sync::Arc;
use crate::store::{IpBlocklist, SessionStore, Stores};
// app's shared state

pub struct AppState {
    pub sessions: Arc<dyn SessionStore>,
    pub blocklist: Arc<dyn IpBlocklist>,
    pub default_limit: i64,      // limit for admin adds without one
    pub default_ban_minutes: i64, // ban length for block requests without one
}

impl AppState {
    pub fn new(stores: &Stores, default_limit: i64, default_ban_minutes: i64) -> Self {
        Self {
            sessions: stores.sessions.clone(),
            blocklist: stores.blocklist.clone(),
            default_limit,
            default_ban_minutes,
        }
    }
}
