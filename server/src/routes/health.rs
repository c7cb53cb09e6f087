//! Health check endpoint.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use sparkwms_engine::HealthResponse;

use crate::{db, AppState};

/// Create health routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(root))
}

/// Health check handler. Devices probe this before sending, so it only
/// reports ok when the database can take a commit.
async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let (code, status) = match db::ping(&state.pool).await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(e) => {
            tracing::warn!("Health check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}

/// Root handler.
async fn root() -> &'static str {
    "SparkWMS Commit Server"
}
