//! Configuration for the session and the commit manager.

use crate::backoff::BackoffPolicy;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Queue file used when no path is given.
pub const DEFAULT_QUEUE_PATH: &str = "commit_queue.log";

/// Timing knobs for the background commit manager.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// How long to sleep when the queue is empty
    pub idle_poll: Duration,
    /// How long to wait before re-checking a closed connectivity gate
    pub gate_poll: Duration,
    /// Delay schedule after failed deliveries
    pub backoff: BackoffPolicy,
    /// Upper bound for a single delivery attempt
    pub send_timeout: Duration,
    /// Attempts after which a stuck entry is escalated
    pub escalate_after: u32,
    /// Minimum spacing of health probes after a failed one
    pub probe_cooldown: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            idle_poll: Duration::from_secs(1),
            gate_poll: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
            send_timeout: Duration::from_secs(30),
            escalate_after: 10,
            probe_cooldown: Duration::from_secs(5),
        }
    }
}

/// Settings for a [`crate::Session`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Location of the queue log
    pub queue_path: PathBuf,
    /// Server connection string; the delivery client is built from it
    pub connect_string: Option<String>,
    /// Queue a commit whose immediate send failed instead of dropping it
    pub queue_on_send_failure: bool,
    /// Commit manager settings
    pub manager: ManagerConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_path: PathBuf::from(DEFAULT_QUEUE_PATH),
            connect_string: None,
            queue_on_send_failure: true,
            manager: ManagerConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Defaults with the given queue path. An empty path means the default.
    pub fn new(queue_path: Option<PathBuf>) -> Self {
        Self {
            queue_path: resolve_queue_path(queue_path),
            ..Self::default()
        }
    }

    pub fn with_connect_string(mut self, connect_string: impl Into<String>) -> Self {
        self.connect_string = Some(connect_string.into());
        self
    }

    pub fn with_manager(mut self, manager: ManagerConfig) -> Self {
        self.manager = manager;
        self
    }

    pub fn with_queue_on_send_failure(mut self, enabled: bool) -> Self {
        self.queue_on_send_failure = enabled;
        self
    }

    /// Load overrides from environment variables.
    ///
    /// - `SPARKWMS_QUEUE_PATH`
    /// - `SPARKWMS_CONNECT`
    /// - `SPARKWMS_BACKOFF_BASE_MS`, `SPARKWMS_BACKOFF_MAX_MS`
    /// - `SPARKWMS_SEND_TIMEOUT_MS`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::new(env::var("SPARKWMS_QUEUE_PATH").ok().map(PathBuf::from));

        config.connect_string = env::var("SPARKWMS_CONNECT")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let base = millis_var("SPARKWMS_BACKOFF_BASE_MS")?;
        let max = millis_var("SPARKWMS_BACKOFF_MAX_MS")?;
        if base.is_some() || max.is_some() {
            let defaults = BackoffPolicy::default();
            config.manager.backoff = BackoffPolicy::new(
                base.unwrap_or(defaults.base),
                max.unwrap_or(defaults.max),
            );
        }

        if let Some(timeout) = millis_var("SPARKWMS_SEND_TIMEOUT_MS")? {
            config.manager.send_timeout = timeout;
        }

        Ok(config)
    }
}

/// Map a missing or empty path to [`DEFAULT_QUEUE_PATH`].
pub fn resolve_queue_path(path: Option<PathBuf>) -> PathBuf {
    path.filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_QUEUE_PATH))
}

fn millis_var(name: &'static str) -> Result<Option<Duration>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| ConfigError::InvalidNumber { name, value }),
        Err(_) => Ok(None),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be a whole number of milliseconds, got '{value}'")]
    InvalidNumber { name: &'static str, value: String },
}
