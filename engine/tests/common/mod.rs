//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use sparkwms_engine::{
    BackoffPolicy, Commit, CommitId, Delivered, DeliveryClient, DeliveryError, ManagerConfig,
};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
struct Ledger {
    seen: HashSet<CommitId>,
    applied: Vec<CommitId>,
    stock: HashMap<(String, i16), i64>,
}

/// In-memory server that applies each commit id at most once.
#[derive(Default)]
pub struct FakeServer {
    ledger: Mutex<Ledger>,
    calls: AtomicUsize,
    fail_next: AtomicUsize,
    lose_acks: AtomicUsize,
    delay_ms: AtomicUsize,
    unhealthy: AtomicBool,
    reject_token: AtomicBool,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Refuse the next `n` sends before applying anything.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Apply the next `n` commits but report a network error.
    pub fn lose_next_acks(&self, n: usize) {
        self.lose_acks.store(n, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.unhealthy.store(!healthy, Ordering::SeqCst);
    }

    /// Answer health checks with 401 until cleared.
    pub fn reject_token(&self, reject: bool) {
        self.reject_token.store(reject, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Commit ids in the order they were first applied.
    pub fn applied(&self) -> Vec<CommitId> {
        self.ledger.lock().unwrap().applied.clone()
    }

    pub fn stock(&self, location: &str, item_id: i16) -> i64 {
        self.ledger
            .lock()
            .unwrap()
            .stock
            .get(&(location.to_string(), item_id))
            .copied()
            .unwrap_or(0)
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DeliveryClient for FakeServer {
    async fn send_commit(&self, commit: &Commit) -> Result<Delivered, DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }

        if Self::take(&self.fail_next) {
            return Err(DeliveryError::Network("connection refused".into()));
        }

        let applied = {
            let mut ledger = self.ledger.lock().unwrap();
            let fresh = ledger.seen.insert(commit.commit_id());
            if fresh {
                ledger.applied.push(commit.commit_id());
                *ledger
                    .stock
                    .entry((commit.location().to_string(), commit.item_id()))
                    .or_default() += i64::from(commit.delta());
            }
            fresh
        };

        if Self::take(&self.lose_acks) {
            return Err(DeliveryError::Network("connection reset".into()));
        }

        Ok(Delivered {
            commit_id: commit.commit_id(),
            applied,
        })
    }

    async fn check(&self) -> Result<bool, DeliveryError> {
        if self.reject_token.load(Ordering::SeqCst) {
            return Err(DeliveryError::Unauthorized);
        }
        Ok(!self.unhealthy.load(Ordering::SeqCst))
    }
}

/// Manager timings short enough for tests.
pub fn fast_config() -> ManagerConfig {
    ManagerConfig {
        idle_poll: Duration::from_millis(10),
        gate_poll: Duration::from_millis(10),
        backoff: BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(50)),
        send_timeout: Duration::from_secs(2),
        escalate_after: 3,
        probe_cooldown: Duration::ZERO,
    }
}

pub fn commit(location: &str, item_id: i64, delta: i64) -> Commit {
    Commit::new("dev-1", location, item_id, delta, 1_700_000_000_000).unwrap()
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// Blocking variant for tests that drive a `Session`.
pub fn wait_until_blocking<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

/// Run `fut` on a fresh runtime; for sync tests that need a one-off async call.
pub fn block_on<F: Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(fut)
}
