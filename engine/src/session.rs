//! Queue facade exposed to the presentation layer.
//!
//! A [`Session`] owns everything one device needs: the Tokio runtime, the
//! [`QueueStore`], the delivery client and the background
//! [`CommitManager`]. Its methods are synchronous so they can be called
//! straight from a UI thread or through the C ABI.

use crate::clock::{Clock, SystemClock};
use crate::commit::Commit;
use crate::config::{resolve_queue_path, SessionConfig};
use crate::delivery::DeliveryClient;
use crate::error::{DeliveryError, Error, ManagerError, QueueError};
use crate::gate::WifiFailsafe;
use crate::http::HttpDeliveryClient;
use crate::manager::{CommitManager, ManagerStatus};
use crate::store::{QueueEntry, QueueStore};
use crate::Sequence;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::runtime::Runtime;

/// Builds a [`Session`] with an injected client or clock.
pub struct SessionBuilder {
    config: SessionConfig,
    client: Option<Arc<dyn DeliveryClient>>,
    clock: Arc<dyn Clock>,
}

impl SessionBuilder {
    /// Use `client` instead of one built from the connection string.
    pub fn client(mut self, client: Arc<dyn DeliveryClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Open the queue, recover it and start the runtime. The manager is not
    /// started.
    pub fn open(self) -> Result<Session, Error> {
        let config = self.config;

        let client = match (self.client, config.connect_string.as_deref()) {
            (Some(client), _) => Some(client),
            (None, Some(cs)) => Some(Arc::new(HttpDeliveryClient::with_timeout(
                cs,
                config.manager.send_timeout,
            )?) as Arc<dyn DeliveryClient>),
            (None, None) => None,
        };

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("sparkwms-sync")
            .enable_all()
            .build()
            .map_err(|e| ManagerError::Runtime(e.to_string()))?;

        let store = Arc::new(QueueStore::open(&config.queue_path)?);
        tracing::info!(
            path = %config.queue_path.display(),
            pending = store.len()?,
            "Session opened"
        );

        Ok(Session {
            config,
            runtime,
            store,
            clock: self.clock,
            client: RwLock::new(client),
            network_available: AtomicBool::new(true),
            gate: Mutex::new(None),
            manager: Mutex::new(None),
        })
    }
}

/// One device's commit queue and sync manager.
pub struct Session {
    config: SessionConfig,
    runtime: Runtime,
    store: Arc<QueueStore>,
    clock: Arc<dyn Clock>,
    client: RwLock<Option<Arc<dyn DeliveryClient>>>,
    network_available: AtomicBool,
    gate: Mutex<Option<Arc<WifiFailsafe>>>,
    manager: Mutex<Option<CommitManager>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("queue_path", &self.config.queue_path)
            .field("manager_running", &self.is_manager_running())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Open a session with the system clock and, when the config carries a
    /// connection string, an HTTP delivery client.
    pub fn open(config: SessionConfig) -> Result<Self, Error> {
        Self::builder(config).open()
    }

    pub fn builder(config: SessionConfig) -> SessionBuilder {
        SessionBuilder {
            config,
            client: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn queue_path(&self) -> &Path {
        self.store.path()
    }

    /// Validate a commit and append it to the durable queue.
    ///
    /// Returns once the entry is on disk. A running manager is woken so the
    /// commit goes out without waiting for the next idle poll.
    pub fn enqueue(
        &self,
        device_id: &str,
        location: &str,
        item_id: i64,
        delta: i64,
    ) -> Result<Sequence, QueueError> {
        let commit = Commit::new(device_id, location, item_id, delta, self.clock.now())?;
        let seq = self.store.enqueue(commit)?;
        tracing::debug!(seq, "Commit queued");
        self.wake_manager();
        Ok(seq)
    }

    /// Number of commits still waiting for delivery.
    pub fn queue_length(&self) -> Result<usize, QueueError> {
        Ok(self.store.len()?)
    }

    /// Pending entries, oldest first.
    pub fn entries(&self) -> Result<Vec<QueueEntry>, QueueError> {
        Ok(self.store.entries()?)
    }

    /// Deliver a commit right away, bypassing the queue.
    ///
    /// Returns `Ok(true)` when the server confirmed it. When delivery fails
    /// and `queue_on_send_failure` is set, the commit is queued under the same
    /// commit id and `Ok(false)` is returned.
    pub fn send_now(
        &self,
        device_id: &str,
        location: &str,
        item_id: i64,
        delta: i64,
    ) -> Result<bool, DeliveryError> {
        let commit = Commit::new(device_id, location, item_id, delta, self.clock.now())?;
        let client = self.client().ok_or(DeliveryError::NotConfigured)?;

        let timeout = self.config.manager.send_timeout;
        let outcome = self.runtime.block_on(async {
            match tokio::time::timeout(timeout, client.send_commit(&commit)).await {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::Timeout(timeout)),
            }
        });

        match outcome {
            Ok(delivered) => {
                tracing::info!(
                    commit_id = %delivered.commit_id,
                    applied = delivered.applied,
                    "Commit sent"
                );
                Ok(true)
            }
            Err(err) if self.config.queue_on_send_failure => {
                let commit_id = commit.commit_id();
                let seq = self.store.enqueue(commit)?;
                tracing::warn!(seq, %commit_id, error = %err, "Immediate send failed, commit queued");
                self.wake_manager();
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Start the background manager against the server at `connect_string`.
    ///
    /// Starting while the manager runs is a no-op that returns `Ok(true)`.
    /// `queue_path`, when given and non-empty, must name this session's
    /// queue.
    pub fn start_commit_manager(
        &self,
        connect_string: &str,
        queue_path: Option<&Path>,
    ) -> Result<bool, ManagerError> {
        if self.is_manager_running() {
            tracing::debug!("Commit manager already running");
            return Ok(true);
        }

        if connect_string.trim().is_empty() {
            return Err(ManagerError::MissingCredentials);
        }

        if let Some(requested) = queue_path.filter(|p| !p.as_os_str().is_empty()) {
            let requested = resolve_queue_path(Some(requested.to_path_buf()));
            if !same_file(&requested, self.store.path()) {
                return Err(ManagerError::QueuePathMismatch {
                    expected: self.store.path().to_path_buf(),
                    requested,
                });
            }
        }

        let client = HttpDeliveryClient::with_timeout(
            connect_string,
            self.config.manager.send_timeout,
        )
        .map_err(|e| match e {
            DeliveryError::InvalidConnectString(reason) => {
                ManagerError::InvalidConnectString(reason)
            }
            other => ManagerError::Runtime(other.to_string()),
        })?;

        tracing::info!(server = %client.base_url(), "Using delivery server");
        self.set_client(Arc::new(client))?;
        self.start()
    }

    /// Start the background manager with the session's current client.
    pub fn start(&self) -> Result<bool, ManagerError> {
        let mut slot = self.manager_slot()?;
        if slot.as_ref().is_some_and(CommitManager::is_running) {
            return Ok(true);
        }

        let client = self.client().ok_or(ManagerError::MissingCredentials)?;

        let gate = Arc::new(WifiFailsafe::with_probe(
            Arc::clone(&client),
            self.config.manager.probe_cooldown,
        ));
        gate.set_network_available(self.network_available.load(Ordering::SeqCst));
        *self.gate_slot()? = Some(Arc::clone(&gate));

        let manager = CommitManager::builder(Arc::clone(&self.store), client)
            .gate(gate)
            .clock(Arc::clone(&self.clock))
            .config(self.config.manager.clone())
            .spawn(self.runtime.handle());

        *slot = Some(manager);
        Ok(true)
    }

    /// Stop the manager and wait for it. Returns `false` if it was not running.
    pub fn stop_commit_manager(&self) -> Result<bool, ManagerError> {
        let manager = self.manager_slot()?.take();
        match manager {
            Some(manager) => {
                self.runtime.block_on(manager.stop())?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Status of the manager, if one was started.
    pub fn manager_status(&self) -> Option<ManagerStatus> {
        self.manager
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(CommitManager::status))
    }

    pub fn is_manager_running(&self) -> bool {
        self.manager
            .lock()
            .map(|slot| slot.as_ref().is_some_and(CommitManager::is_running))
            .unwrap_or(false)
    }

    /// Probe the server. Any failure is reported as `Ok(false)`.
    pub fn health_check(&self) -> Result<bool, DeliveryError> {
        let client = self.client().ok_or(DeliveryError::NotConfigured)?;
        let timeout = self.config.manager.send_timeout;

        let healthy = self.runtime.block_on(async {
            match tokio::time::timeout(timeout, client.check()).await {
                Ok(Ok(healthy)) => healthy,
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "Health check failed");
                    false
                }
                Err(_) => {
                    tracing::debug!("Health check timed out");
                    false
                }
            }
        });
        Ok(healthy)
    }

    /// Forward the platform's connectivity flag to the gate.
    pub fn set_network_available(&self, available: bool) {
        self.network_available.store(available, Ordering::SeqCst);
        if let Ok(gate) = self.gate.lock() {
            if let Some(gate) = gate.as_ref() {
                gate.set_network_available(available);
            }
        }
    }

    /// Stop the manager and release the queue.
    pub fn close(self) -> Result<(), ManagerError> {
        self.stop_commit_manager()?;
        Ok(())
    }

    fn client(&self) -> Option<Arc<dyn DeliveryClient>> {
        self.client.read().ok().and_then(|c| c.clone())
    }

    fn set_client(&self, client: Arc<dyn DeliveryClient>) -> Result<(), ManagerError> {
        let mut slot = self
            .client
            .write()
            .map_err(|_| ManagerError::Runtime("client lock poisoned".to_string()))?;
        *slot = Some(client);
        Ok(())
    }

    fn wake_manager(&self) {
        if let Ok(slot) = self.manager.lock() {
            if let Some(manager) = slot.as_ref() {
                manager.wake();
            }
        }
    }

    fn manager_slot(&self) -> Result<MutexGuard<'_, Option<CommitManager>>, ManagerError> {
        self.manager
            .lock()
            .map_err(|_| ManagerError::Runtime("manager lock poisoned".to_string()))
    }

    fn gate_slot(&self) -> Result<MutexGuard<'_, Option<Arc<WifiFailsafe>>>, ManagerError> {
        self.gate
            .lock()
            .map_err(|_| ManagerError::Runtime("gate lock poisoned".to_string()))
    }
}

/// Path equality that sees through relative paths and symlinks.
fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let manager = match self.manager.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(manager) = manager {
            if let Err(e) = self.runtime.block_on(manager.stop()) {
                tracing::warn!(error = %e, "Commit manager did not stop cleanly");
            }
        }
    }
}
