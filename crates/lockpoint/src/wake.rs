//! Per-process wake coordination for pending lock attempts.
//!
//! The coordinator owns one multiplexed subscription per lockpoint and the
//! registries that turn channel notifications into wake-ups. Registration
//! always happens before the acquire round trip is sent: subscribing after
//! a failed attempt would let the unlocking publisher fire before the
//! subscription exists, losing the wake-up for good. The watchdog's
//! TTL-based re-poll is the backstop, not the primary path.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Weak;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::trace;
use tracing::warn;

use crate::error::StoreError;
use crate::keys;
use crate::ops::LockOps;
use crate::store::LockStore;
use crate::store::Subscription;
use crate::watchdog::Watchdog;
use crate::wire::Notification;

/// Registry of local waiters and the signals that wake them.
#[derive(Default)]
struct Registry {
    /// Armed single-fire wake signals, keyed by lock id.
    signals: HashMap<u64, oneshot::Sender<()>>,
    /// Unfair-eligible waiters per lockpoint; FREE picks one of these.
    unfair: HashMap<String, HashSet<u64>>,
    /// Read waiters per lockpoint; SHARED wakes all of them.
    readers: HashMap<String, HashSet<u64>>,
    /// Lock ids confirmed to be shared-lock owners, consulted at release.
    owners: HashSet<u64>,
    /// Live channel subscriptions, refcounted by local waiters.
    subscriptions: HashMap<String, SubscriptionEntry>,
}

impl Registry {
    fn enroll(&mut self, lockpoint: &str, lock_id: u64, is_read: bool, is_fair: bool) {
        if is_read {
            self.readers
                .entry(lockpoint.to_string())
                .or_default()
                .insert(lock_id);
        }
        if !is_fair {
            self.unfair
                .entry(lockpoint.to_string())
                .or_default()
                .insert(lock_id);
        }
    }
}

struct SubscriptionEntry {
    waiters: usize,
    task: JoinHandle<()>,
}

pub(crate) struct WakeInner {
    store: Arc<dyn LockStore>,
    watchdog: Watchdog,
    prefix: Arc<str>,
    client_id: Arc<str>,
    state: Mutex<Registry>,
}

/// Handle used by lock handles to register and resolve pending attempts.
#[derive(Clone)]
pub(crate) struct WakeCoordinator {
    inner: Arc<WakeInner>,
}

impl WakeCoordinator {
    pub(crate) fn new(
        store: Arc<dyn LockStore>,
        watchdog: Watchdog,
        prefix: Arc<str>,
        client_id: Arc<str>,
    ) -> Self {
        Self {
            inner: Arc::new(WakeInner {
                store,
                watchdog,
                prefix,
                client_id,
                state: Mutex::new(Registry::default()),
            }),
        }
    }

    /// Register a pending attempt: subscribe the lockpoint (shared across
    /// local waiters) and enroll the waiter in the wake registries.
    ///
    /// The returned guard deregisters on drop, so an abandoned future can
    /// never leave a waiter enrolled or a queue entry standing.
    pub(crate) async fn register(
        &self,
        ops: &LockOps,
        lockpoint: &str,
        lock_id: u64,
        is_read: bool,
        is_fair: bool,
    ) -> Result<WaiterGuard, StoreError> {
        let channel = keys::channel(&self.inner.prefix, lockpoint);
        loop {
            {
                let mut state = self.inner.state.lock();
                if let Some(entry) = state.subscriptions.get_mut(lockpoint) {
                    entry.waiters += 1;
                    state.enroll(lockpoint, lock_id, is_read, is_fair);
                    return Ok(WaiterGuard::new(&self.inner, ops, lockpoint, lock_id));
                }
            }

            // No feed for this lockpoint yet; open one outside the lock.
            let subscription = self.inner.store.subscribe(&channel).await?;
            let mut state = self.inner.state.lock();
            if state.subscriptions.contains_key(lockpoint) {
                // Lost the race to another waiter; the extra subscription
                // is dropped and the established feed is joined instead.
                continue;
            }
            let task = spawn_dispatch(&self.inner, lockpoint.to_string(), subscription);
            state
                .subscriptions
                .insert(lockpoint.to_string(), SubscriptionEntry { waiters: 1, task });
            state.enroll(lockpoint, lock_id, is_read, is_fair);
            return Ok(WaiterGuard::new(&self.inner, ops, lockpoint, lock_id));
        }
    }

    /// Record that a lock id became the owner of a shared grant.
    pub(crate) fn mark_owner(&self, lock_id: u64) {
        self.inner.state.lock().owners.insert(lock_id);
    }

    /// Whether a lock id owns the shared count for its lockpoint.
    pub(crate) fn is_owner(&self, lock_id: u64) -> bool {
        self.inner.state.lock().owners.contains(&lock_id)
    }

    /// Forget an owner mark after a successful release.
    pub(crate) fn clear_owner(&self, lock_id: u64) {
        self.inner.state.lock().owners.remove(&lock_id);
    }

    #[cfg(test)]
    pub(crate) fn subscription_count(&self) -> usize {
        self.inner.state.lock().subscriptions.len()
    }

    #[cfg(test)]
    pub(crate) fn watchdog(&self) -> &Watchdog {
        &self.inner.watchdog
    }
}

impl WakeInner {
    fn dispatch(&self, lockpoint: &str, raw: &str) {
        let Some(note) = Notification::parse(raw) else {
            trace!(raw, "dropping malformed notification");
            return;
        };
        if note.lockpoint() != lockpoint {
            trace!(raw, lockpoint, "dropping notification for foreign lockpoint");
            return;
        }
        match note {
            Notification::Free { .. } => self.wake_one_unfair(lockpoint),
            Notification::Shared { .. } => self.wake_all_readers(lockpoint),
            Notification::Unlock {
                client_id, lock_id, ..
            } => {
                if client_id == *self.client_id {
                    self.fire(lock_id);
                }
            }
            Notification::Lock { lease_ms, .. } => {
                // Every subscriber arms its watchdog, not just the grantee:
                // passive observers are what make expiry detection survive
                // the holder crashing.
                self.watchdog.arm(lockpoint, lease_ms);
            }
            Notification::Open { .. } => {}
        }
    }

    fn fire(&self, lock_id: u64) {
        let sender = self.state.lock().signals.remove(&lock_id);
        if let Some(sender) = sender {
            // The waiter may already be gone; a missed send is a no-op.
            let _ = sender.send(());
        }
    }

    fn wake_one_unfair(&self, lockpoint: &str) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(eligible) = state.unfair.get(lockpoint) else {
            return;
        };
        let chosen = eligible
            .iter()
            .copied()
            .find(|id| state.signals.contains_key(id));
        if let Some(lock_id) = chosen {
            if let Some(sender) = state.signals.remove(&lock_id) {
                let _ = sender.send(());
            }
        }
    }

    fn wake_all_readers(&self, lockpoint: &str) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(waiting) = state.readers.get(lockpoint) else {
            return;
        };
        let ids: Vec<u64> = waiting.iter().copied().collect();
        for lock_id in ids {
            if let Some(sender) = state.signals.remove(&lock_id) {
                let _ = sender.send(());
            }
        }
    }

    fn deregister(&self, lockpoint: &str, lock_id: u64) {
        let mut state = self.state.lock();
        state.signals.remove(&lock_id);
        prune(&mut state.unfair, lockpoint, lock_id);
        prune(&mut state.readers, lockpoint, lock_id);
        let drained = match state.subscriptions.get_mut(lockpoint) {
            Some(entry) => {
                entry.waiters = entry.waiters.saturating_sub(1);
                entry.waiters == 0
            }
            None => false,
        };
        if drained {
            if let Some(entry) = state.subscriptions.remove(lockpoint) {
                entry.task.abort();
            }
        }
    }
}

impl Drop for WakeInner {
    fn drop(&mut self) {
        for (_, entry) in self.state.get_mut().subscriptions.drain() {
            entry.task.abort();
        }
    }
}

fn prune(map: &mut HashMap<String, HashSet<u64>>, lockpoint: &str, lock_id: u64) {
    if let Some(set) = map.get_mut(lockpoint) {
        set.remove(&lock_id);
        if set.is_empty() {
            map.remove(lockpoint);
        }
    }
}

fn spawn_dispatch(
    inner: &Arc<WakeInner>,
    lockpoint: String,
    mut subscription: Subscription,
) -> JoinHandle<()> {
    let weak: Weak<WakeInner> = Arc::downgrade(inner);
    tokio::spawn(async move {
        while let Some(raw) = subscription.next_message().await {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.dispatch(&lockpoint, &raw);
        }
        trace!(lockpoint, "notification feed closed");
    })
}

/// One registered pending attempt. Dropping it is the resolution: the
/// waiter leaves every registry, the subscription refcount drops, and a
/// still-queued fair entry is retracted best-effort.
pub(crate) struct WaiterGuard {
    inner: Arc<WakeInner>,
    ops: LockOps,
    lockpoint: String,
    lock_id: u64,
    queued: bool,
}

impl WaiterGuard {
    fn new(inner: &Arc<WakeInner>, ops: &LockOps, lockpoint: &str, lock_id: u64) -> Self {
        Self {
            inner: Arc::clone(inner),
            ops: ops.clone(),
            lockpoint: lockpoint.to_string(),
            lock_id,
            queued: false,
        }
    }

    /// Install a fresh single-fire wake signal for this attempt.
    ///
    /// Armed before each acquire round trip so a delivery can never race an
    /// unregistered waiter.
    pub(crate) fn arm_signal(&self) -> oneshot::Receiver<()> {
        let (sender, receiver) = oneshot::channel();
        self.inner.state.lock().signals.insert(self.lock_id, sender);
        receiver
    }

    /// Record that the attempt now has a store-side fair queue entry.
    pub(crate) fn set_queued(&mut self) {
        self.queued = true;
    }

    /// Record that the attempt was granted; the grant consumed any queue
    /// entry, so nothing needs retracting.
    pub(crate) fn granted(&mut self) {
        self.queued = false;
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.inner.deregister(&self.lockpoint, self.lock_id);
        if self.queued {
            let ops = self.ops.clone();
            let lockpoint = self.lockpoint.clone();
            let lock_id = self.lock_id;
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if let Err(error) = ops.unqueue(&lockpoint, lock_id).await {
                        warn!(lockpoint, lock_id, %error, "failed to retract abandoned waiter");
                    }
                });
            }
        }
    }
}
