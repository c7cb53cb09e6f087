//! Background commit manager.
//!
//! One worker task drains the [`QueueStore`] head first. For each entry it
//! waits out any persisted backoff, asks the [`ConnectivityGate`], sends the
//! commit through the [`DeliveryClient`] and removes the entry once the
//! server confirms it. A failed send bumps the persisted attempt counter and
//! schedules the next attempt; the entry stays at the head of the queue.
//!
//! ```text
//! Idle -> (queue non-empty) -> GateCheck
//! GateCheck -> (gate clear) -> Sending
//! GateCheck -> (gate not clear) -> Waiting -> GateCheck
//! Sending -> (success) -> Acknowledging -> Idle
//! Sending -> (failure) -> Backoff -> GateCheck
//! Idle -> (queue empty) -> Waiting
//! ```
//!
//! The store lock is only held inside store calls, which run on the blocking
//! pool. Gate checks, sends and sleeps happen without it.

use crate::clock::{Clock, SystemClock};
use crate::config::ManagerConfig;
use crate::delivery::DeliveryClient;
use crate::error::{DeliveryError, ManagerError, StorageError};
use crate::gate::{AlwaysClear, ConnectivityGate};
use crate::store::{QueueEntry, QueueStore};
use crate::Sequence;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Where the worker currently is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ManagerState {
    Idle,
    GateCheck,
    Waiting,
    Sending,
    Acknowledging,
    Backoff,
    Stopped,
}

/// Snapshot of the manager for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStatus {
    pub state: ManagerState,
    /// Entry currently being delivered
    pub in_flight: Option<Sequence>,
    /// Commits confirmed by the server since start
    pub delivered: u64,
    /// Failed delivery attempts since start
    pub failed_attempts: u64,
    /// Most recent failure message
    pub last_error: Option<String>,
    /// Head entry that exceeded the escalation threshold
    pub stalled: Option<Sequence>,
}

impl Default for ManagerStatus {
    fn default() -> Self {
        Self {
            state: ManagerState::Idle,
            in_flight: None,
            delivered: 0,
            failed_attempts: 0,
            last_error: None,
            stalled: None,
        }
    }
}

/// Configures and spawns a [`CommitManager`].
pub struct ManagerBuilder {
    store: Arc<QueueStore>,
    client: Arc<dyn DeliveryClient>,
    gate: Arc<dyn ConnectivityGate>,
    clock: Arc<dyn Clock>,
    config: ManagerConfig,
}

impl ManagerBuilder {
    pub fn gate(mut self, gate: Arc<dyn ConnectivityGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Start the worker on `handle`.
    pub fn spawn(self, handle: &Handle) -> CommitManager {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(ManagerStatus::default());
        let wake = Arc::new(Notify::new());

        let worker = Worker {
            store: self.store,
            client: self.client,
            gate: self.gate,
            clock: self.clock,
            config: self.config,
            status: status_tx,
            shutdown: shutdown_rx,
            wake: Arc::clone(&wake),
        };

        let task = handle.spawn(worker.run());

        CommitManager {
            shutdown: shutdown_tx,
            status: status_rx,
            wake,
            task: Some(task),
        }
    }
}

/// Handle to the running worker. Dropping it asks the worker to stop;
/// [`CommitManager::stop`] also waits for it.
pub struct CommitManager {
    shutdown: watch::Sender<bool>,
    status: watch::Receiver<ManagerStatus>,
    wake: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for CommitManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitManager")
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

impl CommitManager {
    /// Builder with an always-clear gate, the system clock and default timings.
    pub fn builder(store: Arc<QueueStore>, client: Arc<dyn DeliveryClient>) -> ManagerBuilder {
        ManagerBuilder {
            store,
            client,
            gate: Arc::new(AlwaysClear),
            clock: Arc::new(SystemClock),
            config: ManagerConfig::default(),
        }
    }

    /// Cut an idle wait short, e.g. right after an enqueue.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Latest status snapshot.
    pub fn status(&self) -> ManagerStatus {
        self.status.borrow().clone()
    }

    /// Receiver that observes every status change.
    pub fn subscribe(&self) -> watch::Receiver<ManagerStatus> {
        self.status.clone()
    }

    /// Whether the worker task is still alive.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the worker and wait for it. An in-flight delivery is allowed to
    /// finish or time out first, so its outcome is recorded.
    pub async fn stop(mut self) -> Result<(), ManagerError> {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| ManagerError::Runtime(format!("commit manager task failed: {e}")))?;
        }
        Ok(())
    }
}

impl Drop for CommitManager {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

struct Worker {
    store: Arc<QueueStore>,
    client: Arc<dyn DeliveryClient>,
    gate: Arc<dyn ConnectivityGate>,
    clock: Arc<dyn Clock>,
    config: ManagerConfig,
    status: watch::Sender<ManagerStatus>,
    shutdown: watch::Receiver<bool>,
    wake: Arc<Notify>,
}

impl Worker {
    async fn run(mut self) {
        tracing::info!(path = %self.store.path().display(), "Commit manager started");

        while !self.stopping() {
            self.step().await;
        }

        self.status.send_modify(|s| {
            s.state = ManagerState::Stopped;
            s.in_flight = None;
        });
        tracing::info!("Commit manager stopped");
    }

    /// One pass through the state machine, ending in a wait or a finished
    /// delivery attempt.
    async fn step(&mut self) {
        self.set_state(ManagerState::Idle);

        let entry = match self.with_store(|s| s.peek_oldest()).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                self.set_state(ManagerState::Waiting);
                self.idle_wait().await;
                return;
            }
            Err(e) => {
                self.storage_failure(&e, "Failed to read queue head");
                self.pause(self.config.backoff.base).await;
                return;
            }
        };

        if let Some(wait) = self.remaining_backoff(&entry) {
            self.set_state(ManagerState::Backoff);
            self.pause(wait).await;
            return;
        }

        self.set_state(ManagerState::GateCheck);
        match self.gate.is_clear_to_send().await {
            Ok(true) => {}
            Ok(false) => {
                tracing::trace!(seq = entry.seq, "Connectivity gate closed");
                self.set_state(ManagerState::Waiting);
                self.pause(self.config.gate_poll).await;
                return;
            }
            Err(err) => {
                self.probe_failure(entry.seq, &err);
                self.pause(self.config.gate_poll).await;
                return;
            }
        }

        self.status.send_modify(|s| {
            s.state = ManagerState::Sending;
            s.in_flight = Some(entry.seq);
        });

        let timeout = self.config.send_timeout;
        let outcome = match tokio::time::timeout(timeout, self.client.send_commit(&entry.commit))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(timeout)),
        };

        match outcome {
            Ok(delivered) => {
                self.set_state(ManagerState::Acknowledging);
                let seq = entry.seq;
                match self.with_store(move |s| s.remove(seq)).await {
                    Ok(_) => {
                        tracing::info!(
                            seq,
                            commit_id = %delivered.commit_id,
                            applied = delivered.applied,
                            "Commit delivered"
                        );
                        self.status.send_modify(|s| {
                            s.delivered += 1;
                            if s.stalled == Some(seq) {
                                s.stalled = None;
                            }
                        });
                    }
                    Err(e) => {
                        // The server has it; redelivery is absorbed by its
                        // commit id check.
                        self.storage_failure(&e, "Failed to remove delivered commit");
                        self.pause(self.config.backoff.base).await;
                    }
                }
            }
            Err(err) => self.delivery_failure(entry, err).await,
        }

        self.status.send_modify(|s| s.in_flight = None);
    }

    async fn delivery_failure(&mut self, entry: QueueEntry, err: DeliveryError) {
        let seq = entry.seq;
        let attempts = entry.attempts.saturating_add(1);
        let delay = self.config.backoff.delay(attempts);
        let next_attempt_at = self
            .clock
            .now()
            .saturating_add(delay.as_millis().min(u64::MAX as u128) as u64);
        let message = err.to_string();

        tracing::warn!(
            seq,
            commit_id = %entry.commit.commit_id(),
            attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Commit delivery failed"
        );

        let recorded = {
            let message = message.clone();
            self.with_store(move |s| s.record_failure(seq, Some(next_attempt_at), &message))
                .await
        };
        let persisted = match recorded {
            Ok(_) => true,
            Err(e) => {
                self.storage_failure(&e, "Failed to record delivery attempt");
                false
            }
        };

        let escalate_after = self.config.escalate_after;
        let escalate = escalate_after > 0 && attempts >= escalate_after;
        if escalate && attempts % escalate_after == 0 {
            tracing::error!(
                seq,
                commit_id = %entry.commit.commit_id(),
                attempts,
                error = %err,
                "Commit keeps failing delivery; queue is blocked behind it"
            );
        }

        self.status.send_modify(|s| {
            s.state = ManagerState::Backoff;
            s.failed_attempts += 1;
            s.last_error = Some(message);
            if escalate {
                s.stalled = Some(seq);
            }
        });

        // Without a persisted deadline the next step would retry at once.
        if !persisted {
            self.pause(delay).await;
        }
    }

    /// A failed health probe holds the queue without spending an attempt.
    /// Rejected credentials will not fix themselves, so they escalate at once.
    fn probe_failure(&self, seq: Sequence, err: &DeliveryError) {
        let escalate = matches!(err, DeliveryError::Unauthorized);
        if escalate {
            tracing::error!(seq, error = %err, "Server rejected credentials; queue is on hold");
        } else {
            tracing::warn!(seq, error = %err, "Health probe failed");
        }

        let message = err.to_string();
        self.status.send_modify(|s| {
            s.state = ManagerState::Waiting;
            s.last_error = Some(message);
            if escalate {
                s.stalled = Some(seq);
            }
        });
    }

    /// Time left before `entry` may be attempted again.
    ///
    /// A deadline further away than the maximum backoff means the wall clock
    /// moved backwards; it is ignored rather than waited out.
    fn remaining_backoff(&self, entry: &QueueEntry) -> Option<Duration> {
        let at = entry.next_attempt_at?;
        let now = self.clock.now();
        if at <= now {
            return None;
        }

        let remaining = Duration::from_millis(at - now);
        if remaining > self.config.backoff.max {
            tracing::debug!(seq = entry.seq, "Ignoring retry deadline beyond maximum backoff");
            return None;
        }
        Some(remaining)
    }

    fn storage_failure(&self, err: &StorageError, context: &'static str) {
        tracing::error!(error = %err, "{context}");
        let message = err.to_string();
        self.status.send_modify(|s| s.last_error = Some(message));
    }

    fn set_state(&self, state: ManagerState) {
        self.status.send_if_modified(|s| {
            let changed = s.state != state;
            s.state = state;
            changed
        });
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep for `duration` unless asked to stop.
    async fn pause(&mut self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shutdown.changed() => {}
        }
    }

    /// Sleep for the idle poll unless woken by an enqueue or asked to stop.
    async fn idle_wait(&mut self) {
        let wake = Arc::clone(&self.wake);
        tokio::select! {
            _ = tokio::time::sleep(self.config.idle_poll) => {}
            _ = wake.notified() => {}
            _ = self.shutdown.changed() => {}
        }
    }

    async fn with_store<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&QueueStore) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
    }
}
