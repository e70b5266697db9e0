//! Tracks which source IPs each user is currently active from.
//!
//! Lines from a live log feed are parsed for an address and an `email:`
//! identity ([`parser`]), applied to a pluggable [`store::SessionStore`]
//! ([`ingest`]), and users that stop showing new addresses are evicted by a
//! periodic sweep ([`reaper`]). A separate [`store::IpBlocklist`] holds ban
//! records managed through the admin API ([`handlers`]).

pub mod config;
pub mod error;
pub mod handlers;
pub mod ingest;
pub mod log_stream;
pub mod metrics;
pub mod models;
pub mod parser;
pub mod reaper;
pub mod state;
pub mod store;

pub use error::{Error, Result};
