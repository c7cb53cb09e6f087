//! Commit handler - applies inventory commits from devices.

use crate::db;
use crate::error::Result;
use sparkwms_engine::{Commit, CommitRequest, CommitResponse};
use sqlx::PgPool;

/// Validate and apply one commit.
///
/// Redelivered commits are acknowledged with `applied = false` so the device
/// can drop them from its queue.
pub async fn handle_commit(pool: &PgPool, request: CommitRequest) -> Result<CommitResponse> {
    let commit = Commit::try_from(request)?;
    let applied = db::apply_commit(pool, &commit).await?;

    if applied {
        tracing::info!(
            commit_id = %commit.commit_id(),
            device_id = commit.device_id(),
            location = commit.location(),
            item_id = commit.item_id(),
            delta = commit.delta(),
            "Applied commit"
        );
    } else {
        tracing::debug!(commit_id = %commit.commit_id(), "Duplicate commit ignored");
    }

    Ok(CommitResponse {
        commit_id: commit.commit_id(),
        applied,
    })
}
