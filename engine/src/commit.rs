//! Commit records: one reported change to an item's quantity at a location.

use crate::error::ValidationError;
use crate::{Delta, ItemId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Maximum byte length of `device_id` and `location`.
pub const MAX_ID_LEN: usize = 256;

/// Identity of one logical commit, used by the server to de-duplicate
/// redelivered commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(Uuid);

impl CommitId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CommitId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for CommitId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ValidationError::InvalidCommitId(e.to_string()))
    }
}

/// A validated inventory change.
///
/// Fields are private so a constructed commit always satisfies its
/// constraints and its id never changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    commit_id: CommitId,
    device_id: String,
    location: String,
    item_id: ItemId,
    delta: Delta,
    enqueued_at: Timestamp,
}

impl Commit {
    /// Build a commit with a freshly generated id.
    ///
    /// `item_id` and `delta` are taken wide so out-of-range values are
    /// rejected instead of truncated.
    pub fn new(
        device_id: &str,
        location: &str,
        item_id: i64,
        delta: i64,
        enqueued_at: Timestamp,
    ) -> Result<Self, ValidationError> {
        Self::with_id(CommitId::new(), device_id, location, item_id, delta, enqueued_at)
    }

    /// Build a commit with a known id (for example one received over the wire).
    pub fn with_id(
        commit_id: CommitId,
        device_id: &str,
        location: &str,
        item_id: i64,
        delta: i64,
        enqueued_at: Timestamp,
    ) -> Result<Self, ValidationError> {
        let device_id = validate_id("device_id", device_id)?;
        let location = validate_id("location", location)?;
        let item_id =
            ItemId::try_from(item_id).map_err(|_| ValidationError::ItemIdOutOfRange(item_id))?;
        let delta = Delta::try_from(delta).map_err(|_| ValidationError::DeltaOutOfRange(delta))?;

        Ok(Self {
            commit_id,
            device_id,
            location,
            item_id,
            delta,
            enqueued_at,
        })
    }

    /// Re-check constraints on a commit that was deserialized.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_id("device_id", &self.device_id)?;
        validate_id("location", &self.location)?;
        Ok(())
    }

    pub fn commit_id(&self) -> CommitId {
        self.commit_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn item_id(&self) -> ItemId {
        self.item_id
    }

    pub fn delta(&self) -> Delta {
        self.delta
    }

    /// When the commit was created (milliseconds since epoch).
    pub fn enqueued_at(&self) -> Timestamp {
        self.enqueued_at
    }
}

fn validate_id(field: &'static str, value: &str) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyField { field });
    }
    if trimmed.len() > MAX_ID_LEN {
        return Err(ValidationError::FieldTooLong {
            field,
            len: trimmed.len(),
            max: MAX_ID_LEN,
        });
    }
    Ok(trimmed.to_string())
}
