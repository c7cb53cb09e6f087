//! Delivery of commits to the server.
//!
//! [`DeliveryClient`] is the seam between the queue and whatever actually
//! talks to the server. The wire types here are shared with the reference
//! server so both ends agree on the JSON shape.

use crate::commit::{Commit, CommitId};
use crate::error::{DeliveryError, ValidationError};
use crate::Timestamp;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Server confirmation for one commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivered {
    pub commit_id: CommitId,
    /// `false` when the server had already applied this commit id.
    pub applied: bool,
}

/// Capability to deliver commits to the server.
///
/// `send_commit` may be called more than once for the same commit id: a
/// lost acknowledgement looks exactly like a failed send. Implementations
/// rely on the server to de-duplicate by [`Commit::commit_id`].
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    /// Submit one commit.
    async fn send_commit(&self, commit: &Commit) -> Result<Delivered, DeliveryError>;

    /// Lightweight reachability probe.
    async fn check(&self) -> Result<bool, DeliveryError>;
}

/// Body of `POST /commits`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRequest {
    pub commit_id: CommitId,
    pub device_id: String,
    pub location: String,
    /// Wide on the wire so out-of-range values reach validation intact.
    pub item_id: i64,
    pub delta: i64,
    pub enqueued_at: Timestamp,
}

impl From<&Commit> for CommitRequest {
    fn from(commit: &Commit) -> Self {
        Self {
            commit_id: commit.commit_id(),
            device_id: commit.device_id().to_string(),
            location: commit.location().to_string(),
            item_id: i64::from(commit.item_id()),
            delta: i64::from(commit.delta()),
            enqueued_at: commit.enqueued_at(),
        }
    }
}

impl TryFrom<CommitRequest> for Commit {
    type Error = ValidationError;

    fn try_from(value: CommitRequest) -> Result<Self, Self::Error> {
        Commit::with_id(
            value.commit_id,
            &value.device_id,
            &value.location,
            value.item_id,
            value.delta,
            value.enqueued_at,
        )
    }
}

/// Response of `POST /commits`.
pub type CommitResponse = Delivered;

/// Response of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl HealthResponse {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}
