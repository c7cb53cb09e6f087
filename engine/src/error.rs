//! Error types for the SparkWMS engine.
//!
//! Each component reports its own error kind. [`Error`] unions them for
//! callers (such as the FFI layer) that need one type and a stable code.

use crate::Sequence;
use std::path::PathBuf;
use thiserror::Error;

/// A commit record failed its field constraints.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    EmptyField { field: &'static str },

    #[error("{field} is too long: {len} bytes (max {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("item id {0} is outside the 16-bit signed range")]
    ItemIdOutOfRange(i64),

    #[error("delta {0} is outside the 32-bit signed range")]
    DeltaOutOfRange(i64),

    #[error("invalid commit id: {0}")]
    InvalidCommitId(String),
}

/// Durable storage failed. The affected record must not be assumed persisted.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("queue log {path} is corrupt at byte {offset}: {reason}")]
    Corrupt {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("stored entry {seq} is invalid: {source}")]
    InvalidEntry {
        seq: Sequence,
        #[source]
        source: ValidationError,
    },

    #[error("queue {0} is already open in another store")]
    Locked(PathBuf),

    #[error("queue store lock was poisoned")]
    Poisoned,

    #[error("storage task failed: {0}")]
    Task(String),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors returned by queue operations on the facade.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Delivery to the server failed or could not be attempted.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("no delivery client configured")]
    NotConfigured,

    #[error("invalid connection string: {0}")]
    InvalidConnectString(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("unauthorized")]
    Unauthorized,

    #[error("server error: {status} {message}")]
    Server { status: u16, message: String },

    #[error("unexpected response: {0}")]
    Protocol(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// The commit manager could not be started.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("connection string is missing or empty")]
    MissingCredentials,

    #[error("invalid connection string: {0}")]
    InvalidConnectString(String),

    #[error("session queue is {expected}, manager was asked to use {requested}")]
    QueuePathMismatch {
        expected: PathBuf,
        requested: PathBuf,
    },

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Union of every engine error.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

impl From<QueueError> for Error {
    fn from(value: QueueError) -> Self {
        match value {
            QueueError::Validation(e) => Error::Validation(e),
            QueueError::Storage(e) => Error::Storage(e),
        }
    }
}

impl Error {
    /// Stable, machine-readable kind used across the FFI boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) | Error::Delivery(DeliveryError::Validation(_)) => "validation",
            Error::Storage(_) | Error::Delivery(DeliveryError::Storage(_)) => "storage",
            Error::Delivery(_) => "delivery",
            Error::Manager(ManagerError::Storage(_)) => "storage",
            Error::Manager(_) => "manager",
            Error::Config(_) => "config",
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
