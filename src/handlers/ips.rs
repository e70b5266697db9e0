use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use crate::error::Error;
use crate::models::BlockedIp;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct BlockParams {
    pub minutes: Option<i64>,
}

pub async fn block_ip_handler(
    State(state): State<Arc<AppState>>,
    Path(ip): Path<String>,
    Query(params): Query<BlockParams>,
) -> Result<Json<BlockedIp>, Error> {
    let minutes = params.minutes.unwrap_or(state.default_ban_minutes);
    let record = state.blocklist.block(&ip, minutes).await?;
    info!(ip = %ip, minutes, "IP blocked");
    Ok(Json(record))
}

pub async fn unblock_ip_handler(
    State(state): State<Arc<AppState>>,
    Path(ip): Path<String>,
) -> Result<Json<serde_json::Value>, Error> {
    let removed = state.blocklist.unblock(&ip).await?;
    info!(ip = %ip, removed, "IP unblocked");
    Ok(Json(serde_json::json!({"removed": removed})))
}

pub async fn list_blocked_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<BlockedIp>>, Error> {
    Ok(Json(state.blocklist.list().await?))
}
