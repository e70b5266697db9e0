use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::error::Error;
use crate::models::{UpsertOutcome, User};
use crate::state::AppState;

// Same shape the log ingester sees: one identity, one address
#[derive(Deserialize)]
pub struct AddUserRequest {
    pub email: String,
    pub ip: String,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Serialize)]
pub struct AddUserResponse {
    pub outcome: UpsertOutcome,
    pub user: User,
}

pub async fn add_user_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddUserRequest>,
) -> Result<Response, Error> {
    let email = req.email.trim();
    let ip = req.ip.trim();
    if email.is_empty() || ip.is_empty() {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "email and ip are required"})),
        )
            .into_response());
    }

    let limit = req.limit.unwrap_or(state.default_limit);
    let (user, outcome) = state.sessions.record(email, ip, limit).await?;
    info!(identity = %email, ip = %ip, outcome = ?outcome, "Admin add user");

    let status = match outcome {
        UpsertOutcome::Unchanged => StatusCode::OK,
        _ => StatusCode::CREATED,
    };
    Ok((status, Json(AddUserResponse { outcome, user })).into_response())
}

pub async fn get_user_handler(
    State(state): State<Arc<AppState>>,
    Path(email): Path<String>,
) -> Result<Response, Error> {
    match state.sessions.get(&email).await? {
        Some(user) => Ok(Json(user).into_response()),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("user {email} not found")})),
        )
            .into_response()),
    }
}

pub async fn list_users_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<User>>, Error> {
    let mut users = state.sessions.list().await?;
    users.sort_by(|a, b| a.identity.cmp(&b.identity));
    Ok(Json(users))
}

pub async fn delete_user_handler(
    State(state): State<Arc<AppState>>,
    Path(email): Path<String>,
) -> Result<StatusCode, Error> {
    state.sessions.delete(&email).await?;
    info!(identity = %email, "Admin delete user");
    Ok(StatusCode::NO_CONTENT)
}
