//! Lock client: the factory for lock handles.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use uuid::Uuid;

use crate::constants::DEFAULT_KEY_PREFIX;
use crate::constants::DEFAULT_LEASE_MS;
use crate::constants::DEFAULT_WAIT_LEASE_MS;
use crate::handle::Fairness;
use crate::handle::LockHandle;
use crate::handle::LockMode;
use crate::ops::LockOps;
use crate::script::ScriptSet;
use crate::store::LockStore;
use crate::wake::WakeCoordinator;
use crate::watchdog::Watchdog;

/// Configuration for a lock client.
#[derive(Debug, Clone)]
pub struct LockClientConfig {
    /// Prefix under which all lockpoint keys and channels live.
    pub key_prefix: String,
    /// Identity this process signs waiter tokens with; random when `None`.
    pub client_id: Option<String>,
    /// Lease attached to grants when no override is given.
    pub default_lease: Duration,
    /// TTL stamped on fair wait-queue structures.
    pub wait_lease: Duration,
}

impl Default for LockClientConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            client_id: None,
            default_lease: Duration::from_millis(DEFAULT_LEASE_MS),
            wait_lease: Duration::from_millis(DEFAULT_WAIT_LEASE_MS),
        }
    }
}

pub(crate) struct ClientShared {
    pub(crate) ops: LockOps,
    pub(crate) coordinator: WakeCoordinator,
    pub(crate) wait_lease_ms: u64,
    default_lease_ms: Arc<AtomicU64>,
    next_lock_id: AtomicU64,
}

impl ClientShared {
    pub(crate) fn default_lease_ms(&self) -> u64 {
        self.default_lease_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn next_lock_id(&self) -> u64 {
        // Monotonic for the life of the process; u64 exhaustion is not a
        // practical concern.
        self.next_lock_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Factory for distributed read-write locks over one store.
///
/// Cheap to clone; clones share the wake coordinator, the watchdog, and
/// the lock-id counter.
#[derive(Clone)]
pub struct LockClient {
    shared: Arc<ClientShared>,
}

impl LockClient {
    /// Build a client over a store.
    pub fn new<S: LockStore>(store: Arc<S>, config: LockClientConfig) -> Self {
        Self::with_store(store as Arc<dyn LockStore>, config)
    }

    /// Build a client over an already type-erased store.
    pub fn with_store(store: Arc<dyn LockStore>, config: LockClientConfig) -> Self {
        let client_id: Arc<str> = config
            .client_id
            .unwrap_or_else(|| Uuid::new_v4().to_string())
            .into();
        let prefix: Arc<str> = config.key_prefix.into();
        let default_lease_ms = Arc::new(AtomicU64::new(
            (config.default_lease.as_millis() as u64).max(1),
        ));

        let ops = LockOps::new(
            Arc::clone(&store),
            ScriptSet::global(),
            Arc::clone(&prefix),
            Arc::clone(&client_id),
        );
        let watchdog = Watchdog::new(ops.clone(), Arc::clone(&default_lease_ms));
        let coordinator = WakeCoordinator::new(store, watchdog, prefix, client_id);

        Self {
            shared: Arc::new(ClientShared {
                ops,
                coordinator,
                wait_lease_ms: (config.wait_lease.as_millis() as u64).max(1),
                default_lease_ms,
                next_lock_id: AtomicU64::new(0),
            }),
        }
    }

    /// Produce the read/write lock pair for a lockpoint.
    pub fn rwlock(&self, name: &str, fairness: Fairness) -> DistributedRwLock {
        DistributedRwLock {
            read: self.read_lock(name, fairness),
            write: self.write_lock(name, fairness),
        }
    }

    /// Mint a standalone read handle.
    pub fn read_lock(&self, name: &str, fairness: Fairness) -> LockHandle {
        self.handle(name, LockMode::Read, fairness)
    }

    /// Mint a standalone write handle.
    pub fn write_lock(&self, name: &str, fairness: Fairness) -> LockHandle {
        self.handle(name, LockMode::Write, fairness)
    }

    /// Client-wide default lease for grants without an override.
    pub fn default_lease(&self) -> Duration {
        Duration::from_millis(self.shared.default_lease_ms())
    }

    /// Change the client-wide default lease.
    ///
    /// Affects future grants and the watchdog's polling fallback; leases
    /// already granted keep their duration.
    pub fn set_default_lease(&self, lease: Duration) {
        self.shared
            .default_lease_ms
            .store((lease.as_millis() as u64).max(1), Ordering::Relaxed);
    }

    /// The identity this process signs waiter tokens and grants with.
    pub fn client_id(&self) -> &str {
        self.shared.ops.client_id()
    }

    fn handle(&self, name: &str, mode: LockMode, fairness: Fairness) -> LockHandle {
        debug_assert!(!name.is_empty(), "lockpoint name must not be empty");
        debug_assert!(
            !name.contains(':'),
            "lockpoint name must not contain the token separator"
        );
        LockHandle::new(Arc::clone(&self.shared), name.to_string(), mode, fairness)
    }
}

/// A read/write handle pair over one lockpoint.
#[derive(Debug)]
pub struct DistributedRwLock {
    read: LockHandle,
    write: LockHandle,
}

impl DistributedRwLock {
    /// The shared-mode handle.
    pub fn read(&mut self) -> &mut LockHandle {
        &mut self.read
    }

    /// The exclusive-mode handle.
    pub fn write(&mut self) -> &mut LockHandle {
        &mut self.write
    }

    /// Split into independently owned handles.
    pub fn into_parts(self) -> (LockHandle, LockHandle) {
        (self.read, self.write)
    }
}
