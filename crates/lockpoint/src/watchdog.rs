//! Lease-renewal watchdog.
//!
//! One live timer per lockpoint per process, armed by LOCK notifications.
//! When a timer fires it refires the lockpoint: either the lease already
//! expired and the hand-off happens right there, or the timer goes back to
//! sleep for the remaining lease. The timer slot is a single mutable cell;
//! arming atomically cancels and replaces the previous timer so duplicate
//! refires cannot race.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::ops::LockOps;
use crate::ops::RefireCode;

struct TimerSlot {
    generation: u64,
    task: JoinHandle<()>,
}

pub(crate) struct WatchdogInner {
    ops: LockOps,
    default_lease_ms: Arc<AtomicU64>,
    timers: Mutex<HashMap<String, TimerSlot>>,
    generation: AtomicU64,
}

/// Cloneable handle on the per-process watchdog.
#[derive(Clone)]
pub(crate) struct Watchdog {
    inner: Arc<WatchdogInner>,
}

impl Watchdog {
    pub(crate) fn new(ops: LockOps, default_lease_ms: Arc<AtomicU64>) -> Self {
        Self {
            inner: Arc::new(WatchdogInner {
                ops,
                default_lease_ms,
                timers: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// (Re)arm the timer for a lockpoint, cancelling any predecessor.
    pub(crate) fn arm(&self, lockpoint: &str, lease_ms: u64) {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let task = tokio::spawn(run_timer(
            Arc::downgrade(&self.inner),
            lockpoint.to_string(),
            generation,
            lease_ms,
        ));

        let mut timers = self.inner.timers.lock();
        if timers
            .get(lockpoint)
            .is_some_and(|slot| slot.generation > generation)
        {
            // A fresher lease was armed while this one was being spawned.
            task.abort();
            return;
        }
        if let Some(previous) = timers.insert(lockpoint.to_string(), TimerSlot { generation, task })
        {
            previous.task.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn armed_for(&self, lockpoint: &str) -> bool {
        self.inner.timers.lock().contains_key(lockpoint)
    }

    #[cfg(test)]
    pub(crate) fn timer_count(&self) -> usize {
        self.inner.timers.lock().len()
    }
}

impl WatchdogInner {
    fn remove_if_current(&self, lockpoint: &str, generation: u64) {
        let mut timers = self.timers.lock();
        if timers
            .get(lockpoint)
            .is_some_and(|slot| slot.generation == generation)
        {
            timers.remove(lockpoint);
        }
    }
}

impl Drop for WatchdogInner {
    fn drop(&mut self) {
        for (_, slot) in self.timers.get_mut().drain() {
            slot.task.abort();
        }
    }
}

async fn run_timer(weak: Weak<WatchdogInner>, lockpoint: String, generation: u64, lease_ms: u64) {
    let mut sleep_ms = lease_ms.max(1);
    loop {
        tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let default_ms = inner.default_lease_ms.load(Ordering::Relaxed).max(1);
        match inner.ops.refire(&lockpoint, default_ms).await {
            Ok(RefireCode::Handled) => {
                // State changed under us; a fresh LOCK notification, if
                // any, re-arms from scratch.
                debug!(lockpoint, "lease expiry handled");
                inner.remove_if_current(&lockpoint, generation);
                return;
            }
            Ok(RefireCode::Reschedule { remaining_ms }) => {
                sleep_ms = remaining_ms.max(1);
            }
            Ok(RefireCode::Poll) => {
                sleep_ms = default_ms;
            }
            Err(error) => {
                warn!(lockpoint, %error, "refire failed; retrying after default lease");
                sleep_ms = default_ms;
            }
        }
        drop(inner);
    }
}
