//! # SparkWMS Engine
//!
//! Durable commit queue and sync manager for warehouse inventory changes.
//!
//! A handheld records stock movements as commits (device, location, item,
//! signed quantity delta). Each commit is written to a crash-safe local log
//! before the caller gets an answer, then delivered to the central server in
//! order by a background worker. Nothing is lost across crashes or network
//! outages, and nothing is applied twice: every commit carries a stable id
//! that the server de-duplicates on.
//!
//! ## Core Concepts
//!
//! ### Commits
//!
//! A [`Commit`] is validated on construction. Item ids must fit in 16 bits
//! and deltas in 32 bits; out-of-range values are rejected before they touch
//! storage or the network.
//!
//! ### Queue Store
//!
//! [`QueueStore`] is an append-only log of checksummed JSON frames. Each
//! append is synced before it returns. On open the log is replayed: a torn
//! final frame is truncated away, damage in the middle is reported.
//!
//! ### Commit Manager
//!
//! [`CommitManager`] drains the queue head first. It waits for the
//! [`ConnectivityGate`], sends through a [`DeliveryClient`] and removes an
//! entry only after the server confirmed it. Failures back off exponentially
//! and the schedule is persisted with the entry.
//!
//! ## Quick Start
//!
//! ```no_run
//! use sparkwms_engine::{Session, SessionConfig};
//!
//! let session = Session::open(SessionConfig::new(Some("commit_queue.log".into())))?;
//! session.enqueue("dev-1", "A1", 42, -5)?;
//! session.start_commit_manager("https://TOKEN@sync.example.com/api", None)?;
//! # Ok::<(), sparkwms_engine::Error>(())
//! ```
//!
//! ## FFI
//!
//! The [`ffi`] module exposes the session as C functions for the mobile
//! front end. All results are exchanged as JSON strings.

pub mod backoff;
pub mod clock;
pub mod commit;
pub mod config;
pub mod delivery;
pub mod error;
pub mod ffi;
pub mod gate;
pub mod http;
pub mod log;
pub mod manager;
pub mod session;
pub mod store;

// Re-export main types at crate root
pub use backoff::BackoffPolicy;
pub use clock::{Clock, ManualClock, SystemClock};
pub use commit::{Commit, CommitId};
pub use config::{ConfigError, ManagerConfig, SessionConfig, DEFAULT_QUEUE_PATH};
pub use delivery::{CommitRequest, CommitResponse, Delivered, DeliveryClient, HealthResponse};
pub use error::{
    DeliveryError, Error, ManagerError, QueueError, Result, StorageError, ValidationError,
};
pub use gate::{AlwaysClear, ConnectivityGate, WifiFailsafe};
pub use http::HttpDeliveryClient;
pub use manager::{CommitManager, ManagerBuilder, ManagerState, ManagerStatus};
pub use session::{Session, SessionBuilder};
pub use store::{QueueEntry, QueueStore, RecoveryReport};

/// Type aliases for clarity
pub type Timestamp = u64;
pub type Sequence = u64;
pub type ItemId = i16;
pub type Delta = i32;

/// Install a `tracing` subscriber that writes to stderr, filtered by
/// `RUST_LOG` (default `sparkwms_engine=info`).
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_logging() -> bool {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sparkwms_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .is_ok()
}
