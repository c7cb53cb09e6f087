//! Commit endpoint routes.

use axum::{extract::State, routing::post, Json, Router};
use sparkwms_engine::{CommitRequest, CommitResponse};

use crate::auth::Authorized;
use crate::error::Result;
use crate::handlers::handle_commit;
use crate::AppState;

/// Create commit routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/commits", post(commit_handler))
}

/// POST /commits - Apply one inventory commit.
async fn commit_handler(
    State(state): State<AppState>,
    _auth: Authorized,
    Json(request): Json<CommitRequest>,
) -> Result<Json<CommitResponse>> {
    let response = handle_commit(&state.pool, request).await?;
    Ok(Json(response))
}
