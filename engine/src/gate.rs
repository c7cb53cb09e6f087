//! Connectivity gate ("wifi failsafe").
//!
//! The gate decides whether a delivery attempt should start right now. A
//! closed gate is a scheduling signal: the manager waits and asks again. It
//! never counts as a failed attempt.

use crate::delivery::DeliveryClient;
use crate::error::DeliveryError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Decides whether delivery may proceed.
///
/// `Ok(false)` is a closed gate. `Err` means the gate is closed because a
/// health probe failed, and carries that failure for status reporting.
#[async_trait]
pub trait ConnectivityGate: Send + Sync {
    async fn is_clear_to_send(&self) -> Result<bool, DeliveryError>;
}

/// A gate that is always open.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysClear;

#[async_trait]
impl ConnectivityGate for AlwaysClear {
    async fn is_clear_to_send(&self) -> Result<bool, DeliveryError> {
        Ok(true)
    }
}

/// Default gate: the platform's network flag plus a rate-limited health probe.
///
/// The presentation layer flips [`WifiFailsafe::set_network_available`] from
/// its connectivity callbacks. When a probe fails, no further probe is made
/// until `probe_cooldown` has passed, so a long outage costs one cheap check
/// per cooldown instead of one per poll.
pub struct WifiFailsafe {
    network_available: AtomicBool,
    probe: Option<Arc<dyn DeliveryClient>>,
    probe_cooldown: Duration,
    last_failed_probe: Mutex<Option<Instant>>,
}

impl WifiFailsafe {
    /// A gate with no health probe; only the network flag matters.
    pub fn new() -> Self {
        Self {
            network_available: AtomicBool::new(true),
            probe: None,
            probe_cooldown: Duration::ZERO,
            last_failed_probe: Mutex::new(None),
        }
    }

    /// A gate that also probes the server before each attempt.
    pub fn with_probe(probe: Arc<dyn DeliveryClient>, probe_cooldown: Duration) -> Self {
        Self {
            probe: Some(probe),
            probe_cooldown,
            ..Self::new()
        }
    }

    pub fn set_network_available(&self, available: bool) {
        let previous = self.network_available.swap(available, Ordering::SeqCst);
        if previous != available {
            tracing::info!(available, "Network availability changed");
            if available {
                // A fresh network gets a fresh probe.
                self.clear_failed_probe();
            }
        }
    }

    pub fn network_available(&self) -> bool {
        self.network_available.load(Ordering::SeqCst)
    }

    fn in_cooldown(&self) -> bool {
        match self.last_failed_probe.lock() {
            Ok(last) => last.is_some_and(|at| at.elapsed() < self.probe_cooldown),
            Err(_) => false,
        }
    }

    fn mark_failed_probe(&self) {
        if let Ok(mut last) = self.last_failed_probe.lock() {
            *last = Some(Instant::now());
        }
    }

    fn clear_failed_probe(&self) {
        if let Ok(mut last) = self.last_failed_probe.lock() {
            *last = None;
        }
    }
}

impl Default for WifiFailsafe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectivityGate for WifiFailsafe {
    async fn is_clear_to_send(&self) -> Result<bool, DeliveryError> {
        if !self.network_available() {
            return Ok(false);
        }

        let Some(probe) = &self.probe else {
            return Ok(true);
        };

        if self.in_cooldown() {
            return Ok(false);
        }

        match probe.check().await {
            Ok(true) => {
                self.clear_failed_probe();
                Ok(true)
            }
            Ok(false) => {
                tracing::debug!("Health probe reported server unavailable");
                self.mark_failed_probe();
                Ok(false)
            }
            Err(e) => {
                self.mark_failed_probe();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::Commit;
    use crate::delivery::Delivered;
    use std::sync::atomic::AtomicUsize;

    struct Probe {
        healthy: AtomicBool,
        checks: AtomicUsize,
    }

    impl Probe {
        fn new(healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                healthy: AtomicBool::new(healthy),
                checks: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl DeliveryClient for Probe {
        async fn send_commit(&self, commit: &Commit) -> Result<Delivered, DeliveryError> {
            Ok(Delivered {
                commit_id: commit.commit_id(),
                applied: true,
            })
        }

        async fn check(&self) -> Result<bool, DeliveryError> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(true)
            } else {
                Err(DeliveryError::Network("unreachable".into()))
            }
        }
    }

    #[tokio::test]
    async fn always_clear() {
        assert!(AlwaysClear.is_clear_to_send().await.unwrap());
    }

    #[tokio::test]
    async fn network_flag_closes_gate() {
        let gate = WifiFailsafe::new();
        assert!(gate.is_clear_to_send().await.unwrap());

        gate.set_network_available(false);
        assert!(!gate.is_clear_to_send().await.unwrap());

        gate.set_network_available(true);
        assert!(gate.is_clear_to_send().await.unwrap());
    }

    #[tokio::test]
    async fn offline_flag_skips_probe() {
        let probe = Probe::new(true);
        let gate = WifiFailsafe::with_probe(probe.clone(), Duration::ZERO);
        gate.set_network_available(false);

        assert!(!gate.is_clear_to_send().await.unwrap());
        assert_eq!(probe.checks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_probe_is_rate_limited() {
        let probe = Probe::new(false);
        let gate = WifiFailsafe::with_probe(probe.clone(), Duration::from_secs(3600));

        // The first probe reports why the gate is closed; the cooldown does not.
        assert!(matches!(
            gate.is_clear_to_send().await,
            Err(DeliveryError::Network(_))
        ));
        assert!(!gate.is_clear_to_send().await.unwrap());
        assert!(!gate.is_clear_to_send().await.unwrap());
        assert_eq!(probe.checks.load(Ordering::SeqCst), 1);

        // Reconnecting resets the cooldown.
        probe.healthy.store(true, Ordering::SeqCst);
        gate.set_network_available(false);
        gate.set_network_available(true);
        assert!(gate.is_clear_to_send().await.unwrap());
        assert_eq!(probe.checks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn healthy_probe_opens_gate_each_time() {
        let probe = Probe::new(true);
        let gate = WifiFailsafe::with_probe(probe.clone(), Duration::from_secs(3600));

        assert!(gate.is_clear_to_send().await.unwrap());
        assert!(gate.is_clear_to_send().await.unwrap());
        assert_eq!(probe.checks.load(Ordering::SeqCst), 2);
    }
}
