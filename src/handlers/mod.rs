mod health;
mod ips;
mod metrics;
mod users;

pub use health::health_handler;
pub use ips::{block_ip_handler, list_blocked_handler, unblock_ip_handler};
pub use metrics::metrics_handler;
pub use users::{add_user_handler, delete_user_handler, get_user_handler, list_users_handler};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tracing::error;

use crate::error::Error;
use crate::metrics::STORE_ERRORS;
use crate::state::AppState;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        STORE_ERRORS.inc();
        error!(error = %self, "Admin request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": self.to_string()})),
        )
            .into_response()
    }
}

// Admin routes, each one maps onto a single store operation
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/users", get(list_users_handler))
        .route("/api/user/add", post(add_user_handler))
        .route("/api/user/{email}", get(get_user_handler))
        .route("/api/user/delete/{email}", delete(delete_user_handler))
        .route("/api/ips", get(list_blocked_handler))
        .route("/api/ip/block/{ip}", post(block_ip_handler))
        .route("/api/ip/unblock/{ip}", post(unblock_ip_handler))
        .with_state(state)
}
