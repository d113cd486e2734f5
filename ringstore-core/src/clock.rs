//! Time sources
//!
//! Everything that reads the time or sleeps goes through [`Clock`] so tests
//! can drive replication and sync with a [`VirtualClock`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};

/// Millisecond clock with an async sleep
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    /// Current time in milliseconds; never goes backwards
    fn now_millis(&self) -> u64;

    /// Suspend for `duration` of this clock's time
    async fn sleep(&self, duration: Duration);
}

/// Wall clock anchored at the Unix epoch, advancing monotonically
#[derive(Debug, Clone)]
pub struct SystemClock {
    epoch_millis: u64,
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        let epoch_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            epoch_millis,
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        self.epoch_millis + self.started.elapsed().as_millis() as u64
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Default)]
struct VirtualState {
    now: u64,
    next_id: u64,
    sleepers: BTreeMap<(u64, u64), oneshot::Sender<()>>,
}

impl VirtualState {
    fn wake_due(&mut self) {
        let pending = self.sleepers.split_off(&(self.now + 1, 0));
        let due = std::mem::replace(&mut self.sleepers, pending);
        for (_, waker) in due {
            let _ = waker.send(());
        }
    }

    fn live_sleepers(&self) -> usize {
        self.sleepers.values().filter(|s| !s.is_closed()).count()
    }
}

/// Manually advanced clock for tests
///
/// Sleepers are woken only by [`advance`](Self::advance) or
/// [`advance_to_wake_all`](Self::advance_to_wake_all).
#[derive(Debug, Default)]
pub struct VirtualClock {
    state: Mutex<VirtualState>,
    registered: Notify,
}

impl VirtualClock {
    pub fn new(start_millis: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(VirtualState {
                now: start_millis,
                ..Default::default()
            }),
            registered: Notify::new(),
        })
    }

    /// Move time forward and wake every sleeper whose deadline passed
    pub fn advance(&self, millis: u64) {
        let mut state = self.state.lock();
        state.now += millis;
        state.wake_due();
    }

    /// Jump to the latest pending deadline and wake everyone.
    /// Returns how far time moved.
    pub fn advance_to_wake_all(&self) -> u64 {
        let mut state = self.state.lock();
        let latest = state
            .sleepers
            .iter()
            .filter(|(_, s)| !s.is_closed())
            .map(|((deadline, _), _)| *deadline)
            .max()
            .unwrap_or(state.now);
        let advanced = latest.saturating_sub(state.now);
        state.now += advanced;
        for (_, waker) in std::mem::take(&mut state.sleepers) {
            let _ = waker.send(());
        }
        advanced
    }

    /// Number of tasks currently blocked in `sleep`
    pub fn pending_sleepers(&self) -> usize {
        self.state.lock().live_sleepers()
    }

    /// Wait until at least `count` tasks are blocked in `sleep`
    pub async fn wait_for_sleepers(&self, count: usize) {
        loop {
            let registered = self.registered.notified();
            if self.pending_sleepers() >= count {
                return;
            }
            registered.await;
        }
    }
}

#[async_trait]
impl Clock for VirtualClock {
    fn now_millis(&self) -> u64 {
        self.state.lock().now
    }

    async fn sleep(&self, duration: Duration) {
        let receiver = {
            let mut state = self.state.lock();
            if duration.is_zero() {
                None
            } else {
                let deadline = state.now + duration.as_millis() as u64;
                let id = state.next_id;
                state.next_id += 1;
                let (tx, rx) = oneshot::channel();
                state.sleepers.insert((deadline, id), tx);
                Some(rx)
            }
        };

        match receiver {
            Some(rx) => {
                self.registered.notify_waiters();
                let _ = rx.await;
            }
            None => tokio::task::yield_now().await,
        }
    }
}
