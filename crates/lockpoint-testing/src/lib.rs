//! Deterministic in-memory store for exercising the lock protocol.
//!
//! Implements the same state transitions as the registered scripts against
//! an in-memory keyspace, with TTLs driven by `tokio::time::Instant` so
//! paused-time tests control lease expiry exactly. Scripts must be loaded
//! before they evaluate, mirroring a store whose script cache starts empty;
//! [`DeterministicLockStore::evict_scripts`] simulates a store restart.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use lockpoint::Script;
use lockpoint::StoreError;
use lockpoint::Subscription;
use lockpoint::keys::LockKeys;
use lockpoint::store::LockStore;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

const SHARED_MARKER: &str = "S";

struct Expiring<T> {
    value: T,
    deadline: Option<Instant>,
}

impl<T> Expiring<T> {
    fn live(&self, now: Instant) -> bool {
        self.deadline.is_none_or(|deadline| deadline > now)
    }
}

#[derive(Default)]
struct StoreState {
    strings: HashMap<String, Expiring<String>>,
    lists: HashMap<String, Expiring<VecDeque<String>>>,
    sets: HashMap<String, Expiring<HashSet<String>>>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
}

/// A deterministic in-memory lock store for testing.
///
/// Thread-safe; clones of the wrapping `Arc` share one keyspace.
pub struct DeterministicLockStore {
    state: Mutex<StoreState>,
    loaded: Mutex<HashSet<String>>,
    fail_evals: AtomicU32,
}

impl Default for DeterministicLockStore {
    fn default() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            loaded: Mutex::new(HashSet::new()),
            fail_evals: AtomicU32::new(0),
        }
    }
}

impl DeterministicLockStore {
    /// Create a new store wrapped in `Arc`.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drop every registered script, as a store restart would.
    pub fn evict_scripts(&self) {
        self.loaded.lock().clear();
    }

    /// Make the next `count` evaluations fail as transiently unavailable.
    pub fn fail_next_evals(&self, count: u32) {
        self.fail_evals.store(count, Ordering::Relaxed);
    }

    /// Current value of a string key, if present and unexpired.
    pub fn value(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.purge(now);
        state.strings.get(key).map(|entry| entry.value.clone())
    }

    /// Current contents of a list key, head first.
    pub fn list(&self, key: &str) -> Vec<String> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.purge(now);
        state
            .lists
            .get(key)
            .map(|entry| entry.value.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Sorted members of a set key.
    pub fn set_members(&self, key: &str) -> Vec<String> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.purge(now);
        let mut members: Vec<String> = state
            .sets
            .get(key)
            .map(|entry| entry.value.iter().cloned().collect())
            .unwrap_or_default();
        members.sort_unstable();
        members
    }

    /// Remaining TTL of a key, `None` when absent or without one.
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.purge(now);
        let deadline = state
            .strings
            .get(key)
            .and_then(|entry| entry.deadline)
            .or_else(|| state.lists.get(key).and_then(|entry| entry.deadline))
            .or_else(|| state.sets.get(key).and_then(|entry| entry.deadline))?;
        Some(deadline.saturating_duration_since(now))
    }

    /// Whether the four keys of a lockpoint are all absent.
    pub fn keyspace_empty(&self, prefix: &str, name: &str) -> bool {
        let keys = LockKeys::new(prefix, name);
        let now = Instant::now();
        let mut state = self.state.lock();
        state.purge(now);
        !state.strings.contains_key(&keys.lockpoint)
            && !state.strings.contains_key(&keys.lockcount)
            && !state.lists.contains_key(&keys.lockwait)
            && !state.sets.contains_key(&keys.lockpool)
    }

    /// Inject a raw payload on a channel, as a foreign publisher would.
    pub fn publish(&self, channel: &str, payload: &str) {
        self.state.lock().publish(channel, payload.to_string());
    }

    /// Number of open subscriptions on a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let mut state = self.state.lock();
        if let Some(senders) = state.subscribers.get_mut(channel) {
            senders.retain(|sender| !sender.is_closed());
        }
        state
            .subscribers
            .get(channel)
            .map(Vec::len)
            .unwrap_or_default()
    }
}

#[async_trait]
impl LockStore for DeterministicLockStore {
    async fn eval(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<i64, StoreError> {
        if self
            .fail_evals
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Unavailable {
                reason: "injected failure".to_string(),
            });
        }
        if !self.loaded.lock().contains(script.sha1_hex()) {
            return Err(StoreError::ScriptMissing {
                name: script.name(),
            });
        }

        let now = Instant::now();
        let mut state = self.state.lock();
        state.purge(now);
        match script.name() {
            "acquire" => Ok(state.acquire(keys, args, now)),
            "release" => Ok(state.release(keys, args)),
            "refire" => Ok(state.refire(keys, args, now)),
            "unqueue" => Ok(state.unqueue(keys, args)),
            other => Err(StoreError::ScriptFailed {
                name: script.name(),
                line: None,
                detail: format!("unknown script '{other}'"),
            }),
        }
    }

    async fn load_script(&self, script: &Script) -> Result<(), StoreError> {
        self.loaded.lock().insert(script.sha1_hex().to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.state
            .lock()
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(sender);
        Ok(Subscription::new(receiver))
    }
}

impl StoreState {
    fn purge(&mut self, now: Instant) {
        self.strings.retain(|_, entry| entry.live(now));
        self.lists.retain(|_, entry| entry.live(now));
        self.sets.retain(|_, entry| entry.live(now));
    }

    fn publish(&mut self, channel: &str, payload: String) {
        if let Some(senders) = self.subscribers.get_mut(channel) {
            senders.retain(|sender| sender.send(payload.clone()).is_ok());
        }
    }

    fn acquire(&mut self, keys: &[String], args: &[String], now: Instant) -> i64 {
        let (kp, kc, kw, kpool) = (&keys[0], &keys[1], &keys[2], &keys[3]);
        let (channel, name, client, lock_id) = (&args[0], &args[1], &args[2], &args[3]);
        let is_read = args[4] == "1";
        let is_fair = args[5] == "1";
        let first = args[6] == "1";
        let lease_ms: u64 = args[7].parse().unwrap_or(1);
        let wait_lease_ms: u64 = args[8].parse().unwrap_or(1);
        let try_only = args[9] == "1";
        let token = format!("{client}:{lock_id}");
        let lease_deadline = now + Duration::from_millis(lease_ms);

        let state = self.strings.get(kp).map(|entry| entry.value.clone());
        let free = matches!(state.as_deref(), None | Some("dead"));

        if free {
            let eligible = if !is_fair {
                true
            } else {
                match self.list_head(kw) {
                    None => true,
                    Some(head) if is_read => {
                        if head == SHARED_MARKER && self.set_contains(kpool, &token) {
                            self.set_remove(kpool, &token);
                            if self.set_len(kpool) == 0 {
                                self.list_pop_head(kw);
                            }
                            true
                        } else {
                            !first
                                && !self.set_contains(kpool, &token)
                                && !self.list_contains(kw, &token)
                        }
                    }
                    Some(head) => {
                        if head == token {
                            self.list_pop_head(kw);
                            true
                        } else {
                            !first && !self.list_contains(kw, &token)
                        }
                    }
                }
            };
            if eligible {
                return if is_read {
                    self.grant_read_first(
                        kp,
                        kc,
                        channel,
                        name,
                        client,
                        lock_id,
                        lease_ms,
                        lease_deadline,
                    )
                } else {
                    self.grant_write(kp, channel, name, client, lock_id, lease_ms, lease_deadline)
                };
            }
        } else if state.as_deref() == Some("open") && is_read {
            let join = if !is_fair || self.list_len(kw) == 0 {
                true
            } else if self.set_contains(kpool, &token) {
                // queued behind a pending writer; the shared hand-off wakes us
                false
            } else {
                !first && !self.list_contains(kw, &token)
            };
            if join {
                return self.grant_read_join(
                    kp,
                    kc,
                    channel,
                    name,
                    client,
                    lock_id,
                    lease_ms,
                    lease_deadline,
                );
            }
        } else if state.as_deref() == Some("open") && is_fair && !is_read && !try_only {
            // a fair writer is now waiting; stop new readers from joining
            if let Some(entry) = self.strings.get_mut(kp) {
                entry.value = "closed".to_string();
            }
        }

        if try_only {
            return -2;
        }

        if is_fair && first {
            let wait_deadline = now + Duration::from_millis(wait_lease_ms);
            if is_read {
                self.set_add(kpool, &token);
                if !self.list_contains(kw, SHARED_MARKER) {
                    self.list_push_tail(kw, SHARED_MARKER);
                }
                if let Some(entry) = self.sets.get_mut(kpool) {
                    entry.deadline = Some(wait_deadline);
                }
            } else {
                self.list_push_tail(kw, &token);
            }
            if let Some(entry) = self.lists.get_mut(kw) {
                entry.deadline = Some(wait_deadline);
            }
        }

        match self.strings.get(kp).and_then(|entry| entry.deadline) {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(now).as_millis() as i64;
                if remaining > 0 { remaining } else { -1 }
            }
            None => -1,
        }
    }

    fn release(&mut self, keys: &[String], args: &[String]) -> i64 {
        let (kp, kc, kw, kpool) = (&keys[0], &keys[1], &keys[2], &keys[3]);
        let (channel, name) = (&args[0], &args[1]);
        let is_read = args[2] == "1";
        let is_owner = args[3] == "1";

        if is_read {
            let Some(entry) = self.strings.get_mut(kc) else {
                return 0;
            };
            let remaining = entry.value.parse::<i64>().unwrap_or(0) - 1;
            entry.value = remaining.to_string();
            if is_owner && remaining <= 0 {
                self.strings.remove(kp);
                self.strings.remove(kc);
                self.handoff(kw, kpool, channel, name);
            }
        } else if self.strings.remove(kp).is_some() {
            self.handoff(kw, kpool, channel, name);
        }
        0
    }

    fn refire(&mut self, keys: &[String], args: &[String], now: Instant) -> i64 {
        let (kp, kc, kw, kpool) = (&keys[0], &keys[1], &keys[2], &keys[3]);
        let (channel, name) = (&args[0], &args[1]);
        let default_lease_ms: u64 = args[2].parse().unwrap_or(1);

        if !self.strings.contains_key(kp) {
            self.strings.remove(kc);
            if self.list_head(kw).is_none() {
                self.strings.insert(
                    kp.to_string(),
                    Expiring {
                        value: "dead".to_string(),
                        deadline: Some(now + Duration::from_millis(default_lease_ms)),
                    },
                );
                self.publish(channel, format!("#:{name}"));
            } else {
                self.handoff(kw, kpool, channel, name);
            }
            return 0;
        }

        match self.strings.get(kp).and_then(|entry| entry.deadline) {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(now).as_millis() as i64;
                if remaining > 0 { remaining } else { -1 }
            }
            None => -1,
        }
    }

    fn unqueue(&mut self, keys: &[String], args: &[String]) -> i64 {
        let (kw, kpool) = (&keys[0], &keys[1]);
        let token = &args[0];

        if let Some(entry) = self.lists.get_mut(kw) {
            entry.value.retain(|item| item != token);
        }
        if self.set_remove(kpool, token) && self.set_len(kpool) == 0 {
            if let Some(entry) = self.lists.get_mut(kw) {
                entry.value.retain(|item| item != SHARED_MARKER);
            }
        }
        self.drop_if_empty(kw, kpool);
        0
    }

    fn handoff(&mut self, kw: &str, kpool: &str, channel: &str, name: &str) {
        match self.list_head(kw) {
            None => self.publish(channel, format!("#:{name}")),
            Some(head) if head == SHARED_MARKER => {
                self.list_pop_head(kw);
                self.sets.remove(kpool);
                self.publish(channel, format!("s:{name}"));
                self.publish(channel, format!("o:{name}"));
            }
            Some(head) => {
                self.list_pop_head(kw);
                self.publish(channel, format!("u:{head}:{name}"));
            }
        }
        self.drop_if_empty(kw, kpool);
    }

    fn grant_write(
        &mut self,
        kp: &str,
        channel: &str,
        name: &str,
        client: &str,
        lock_id: &str,
        lease_ms: u64,
        deadline: Instant,
    ) -> i64 {
        self.strings.insert(
            kp.to_string(),
            Expiring {
                value: "unique".to_string(),
                deadline: Some(deadline),
            },
        );
        self.publish(channel, format!("l:{client}:{lock_id}:{lease_ms}:{name}"));
        0
    }

    #[allow(clippy::too_many_arguments)]
    fn grant_read_first(
        &mut self,
        kp: &str,
        kc: &str,
        channel: &str,
        name: &str,
        client: &str,
        lock_id: &str,
        lease_ms: u64,
        deadline: Instant,
    ) -> i64 {
        self.strings.insert(
            kp.to_string(),
            Expiring {
                value: "open".to_string(),
                deadline: Some(deadline),
            },
        );
        self.strings.insert(
            kc.to_string(),
            Expiring {
                value: "1".to_string(),
                deadline: Some(deadline),
            },
        );
        self.publish(channel, format!("o:{name}"));
        self.publish(channel, format!("l:{client}:{lock_id}:{lease_ms}:{name}"));
        0
    }

    #[allow(clippy::too_many_arguments)]
    fn grant_read_join(
        &mut self,
        kp: &str,
        kc: &str,
        channel: &str,
        name: &str,
        client: &str,
        lock_id: &str,
        lease_ms: u64,
        deadline: Instant,
    ) -> i64 {
        let count = self
            .strings
            .get(kc)
            .and_then(|entry| entry.value.parse::<i64>().ok())
            .unwrap_or(0)
            + 1;
        self.strings.insert(
            kc.to_string(),
            Expiring {
                value: count.to_string(),
                deadline: Some(deadline),
            },
        );
        if let Some(entry) = self.strings.get_mut(kp) {
            entry.deadline = Some(deadline);
        }
        self.publish(channel, format!("l:{client}:{lock_id}:{lease_ms}:{name}"));
        -3
    }

    fn drop_if_empty(&mut self, kw: &str, kpool: &str) {
        if self
            .lists
            .get(kw)
            .is_some_and(|entry| entry.value.is_empty())
        {
            self.lists.remove(kw);
        }
        if self
            .sets
            .get(kpool)
            .is_some_and(|entry| entry.value.is_empty())
        {
            self.sets.remove(kpool);
        }
    }

    fn list_head(&self, key: &str) -> Option<String> {
        self.lists
            .get(key)
            .and_then(|entry| entry.value.front().cloned())
    }

    fn list_pop_head(&mut self, key: &str) {
        let drained = match self.lists.get_mut(key) {
            Some(entry) => {
                entry.value.pop_front();
                entry.value.is_empty()
            }
            None => false,
        };
        if drained {
            self.lists.remove(key);
        }
    }

    fn list_push_tail(&mut self, key: &str, item: &str) {
        self.lists
            .entry(key.to_string())
            .or_insert_with(|| Expiring {
                value: VecDeque::new(),
                deadline: None,
            })
            .value
            .push_back(item.to_string());
    }

    fn list_contains(&self, key: &str, item: &str) -> bool {
        self.lists
            .get(key)
            .is_some_and(|entry| entry.value.iter().any(|candidate| candidate == item))
    }

    fn list_len(&self, key: &str) -> usize {
        self.lists.get(key).map_or(0, |entry| entry.value.len())
    }

    fn set_add(&mut self, key: &str, member: &str) {
        self.sets
            .entry(key.to_string())
            .or_insert_with(|| Expiring {
                value: HashSet::new(),
                deadline: None,
            })
            .value
            .insert(member.to_string());
    }

    fn set_remove(&mut self, key: &str, member: &str) -> bool {
        let (removed, drained) = match self.sets.get_mut(key) {
            Some(entry) => {
                let removed = entry.value.remove(member);
                (removed, entry.value.is_empty())
            }
            None => (false, false),
        };
        if drained {
            self.sets.remove(key);
        }
        removed
    }

    fn set_contains(&self, key: &str, member: &str) -> bool {
        self.sets
            .get(key)
            .is_some_and(|entry| entry.value.contains(member))
    }

    fn set_len(&self, key: &str) -> usize {
        self.sets.get(key).map_or(0, |entry| entry.value.len())
    }
}
