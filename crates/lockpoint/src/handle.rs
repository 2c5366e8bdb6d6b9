//! Client-facing lock handles.
//!
//! A handle is owned by exactly one caller (all locking methods take
//! `&mut self`) and moves UNLOCKED → LOCKED → UNLOCKED. Blocking variants
//! are cancel-safe: dropping the future mid-wait deregisters the waiter and
//! retracts any fair queue entry, so abandonment can never strand local or
//! store-side state.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::client::ClientShared;
use crate::error::LockError;
use crate::ops::AcquireCode;
use crate::ops::AcquireRequest;

/// Queueing policy, fixed at handle creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fairness {
    /// FIFO hand-off order through the store-side wait list.
    Fair,
    /// Best-effort: any eligible waiter may win, no ordering.
    Unfair,
}

impl Fairness {
    /// Whether this policy queues waiters.
    pub fn is_fair(self) -> bool {
        matches!(self, Fairness::Fair)
    }
}

/// Shared or exclusive access, fixed at handle creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared access; any number of concurrent readers.
    Read,
    /// Exclusive access.
    Write,
}

impl LockMode {
    /// Whether this is the shared mode.
    pub fn is_read(self) -> bool {
        matches!(self, LockMode::Read)
    }
}

/// One side of a distributed read-write lock.
pub struct LockHandle {
    shared: Arc<ClientShared>,
    lockpoint: String,
    lock_id: u64,
    mode: LockMode,
    fairness: Fairness,
    locked: bool,
}

impl LockHandle {
    pub(crate) fn new(
        shared: Arc<ClientShared>,
        lockpoint: String,
        mode: LockMode,
        fairness: Fairness,
    ) -> Self {
        let lock_id = shared.next_lock_id();
        Self {
            shared,
            lockpoint,
            lock_id,
            mode,
            fairness,
            locked: false,
        }
    }

    /// The lockpoint this handle is bound to.
    pub fn lockpoint(&self) -> &str {
        &self.lockpoint
    }

    /// Process-unique identity of this handle.
    pub fn lock_id(&self) -> u64 {
        self.lock_id
    }

    /// Shared or exclusive.
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Queueing policy.
    pub fn fairness(&self) -> Fairness {
        self.fairness
    }

    /// Whether this handle currently holds its lock.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Acquire, waiting as long as it takes, with the client default lease.
    pub async fn lock(&mut self) -> Result<(), LockError> {
        let granted = self.acquire_blocking(None, None).await?;
        debug_assert!(granted, "unbounded acquire cannot time out");
        Ok(())
    }

    /// Acquire, waiting as long as it takes, overriding the lease for this
    /// acquisition only.
    pub async fn lock_with_lease(&mut self, lease: Duration) -> Result<(), LockError> {
        let granted = self.acquire_blocking(None, Some(lease)).await?;
        debug_assert!(granted, "unbounded acquire cannot time out");
        Ok(())
    }

    /// Instantaneous attempt: a single round trip, never queues.
    pub async fn try_lock(&mut self) -> Result<bool, LockError> {
        self.acquire_try(None).await
    }

    /// Instantaneous attempt with a lease override.
    pub async fn try_lock_with_lease(&mut self, lease: Duration) -> Result<bool, LockError> {
        self.acquire_try(Some(lease)).await
    }

    /// Bounded wait. Returns `Ok(false)` on timeout, which is distinct from
    /// every store failure.
    pub async fn try_lock_for(&mut self, wait: Duration) -> Result<bool, LockError> {
        self.acquire_blocking(Some(wait), None).await
    }

    /// Bounded wait with a lease override.
    pub async fn try_lock_for_with_lease(
        &mut self,
        wait: Duration,
        lease: Duration,
    ) -> Result<bool, LockError> {
        self.acquire_blocking(Some(wait), Some(lease)).await
    }

    /// Release the lock. A no-op when the handle is not locked.
    pub async fn unlock(&mut self) -> Result<(), LockError> {
        if !self.locked {
            return Ok(());
        }
        let is_read = self.mode.is_read();
        let is_owner = if is_read {
            self.shared.coordinator.is_owner(self.lock_id)
        } else {
            true
        };
        self.shared
            .ops
            .release(&self.lockpoint, is_read, is_owner)
            .await?;
        if is_read {
            self.shared.coordinator.clear_owner(self.lock_id);
        }
        self.locked = false;
        Ok(())
    }

    async fn acquire_try(&mut self, lease: Option<Duration>) -> Result<bool, LockError> {
        self.ensure_unlocked()?;
        let request = AcquireRequest {
            name: &self.lockpoint,
            lock_id: self.lock_id,
            is_read: self.mode.is_read(),
            is_fair: self.fairness.is_fair(),
            first_attempt: true,
            lease_ms: self.lease_ms(lease),
            wait_lease_ms: self.shared.wait_lease_ms,
            try_only: true,
        };
        match self.shared.ops.acquire(&request).await? {
            AcquireCode::Granted => {
                if self.mode.is_read() {
                    self.shared.coordinator.mark_owner(self.lock_id);
                }
                self.locked = true;
                Ok(true)
            }
            AcquireCode::GrantedShared => {
                self.locked = true;
                Ok(true)
            }
            AcquireCode::TryFailed | AcquireCode::Busy { .. } | AcquireCode::NoTtl => Ok(false),
        }
    }

    async fn acquire_blocking(
        &mut self,
        wait: Option<Duration>,
        lease: Option<Duration>,
    ) -> Result<bool, LockError> {
        self.ensure_unlocked()?;
        let deadline = wait.map(|wait| Instant::now() + wait);
        let lease_ms = self.lease_ms(lease);
        let is_read = self.mode.is_read();
        let is_fair = self.fairness.is_fair();

        // Subscribe-then-acquire; the guard resolves the registration on
        // every exit path, including cancellation.
        let mut guard = self
            .shared
            .coordinator
            .register(
                &self.shared.ops,
                &self.lockpoint,
                self.lock_id,
                is_read,
                is_fair,
            )
            .await?;

        let mut first_attempt = true;
        loop {
            let signal = guard.arm_signal();
            let request = AcquireRequest {
                name: &self.lockpoint,
                lock_id: self.lock_id,
                is_read,
                is_fair,
                first_attempt,
                lease_ms,
                wait_lease_ms: self.shared.wait_lease_ms,
                try_only: false,
            };
            match self.shared.ops.acquire(&request).await? {
                AcquireCode::Granted => {
                    if is_read {
                        self.shared.coordinator.mark_owner(self.lock_id);
                    }
                    guard.granted();
                    self.locked = true;
                    return Ok(true);
                }
                AcquireCode::GrantedShared => {
                    guard.granted();
                    self.locked = true;
                    return Ok(true);
                }
                AcquireCode::TryFailed => {
                    return Err(LockError::UnexpectedCode {
                        lockpoint: self.lockpoint.clone(),
                        code: -2,
                    });
                }
                code @ (AcquireCode::Busy { .. } | AcquireCode::NoTtl) => {
                    if is_fair && first_attempt {
                        guard.set_queued();
                    }
                    // The remaining lease bounds the wait: even if every
                    // notification is lost, the key expires by then and the
                    // retry observes it.
                    let hint_ms = match code {
                        AcquireCode::Busy { remaining_ms } => remaining_ms,
                        _ => self.shared.default_lease_ms(),
                    };
                    let mut slice = Duration::from_millis(hint_ms.max(1));
                    if let Some(deadline) = deadline {
                        let now = Instant::now();
                        if now >= deadline {
                            return Ok(false);
                        }
                        slice = slice.min(deadline - now);
                    }
                    let _ = tokio::time::timeout(slice, signal).await;
                    first_attempt = false;
                }
            }
        }
    }

    fn ensure_unlocked(&self) -> Result<(), LockError> {
        if self.locked {
            return Err(LockError::AlreadyHeld {
                lockpoint: self.lockpoint.clone(),
            });
        }
        Ok(())
    }

    fn lease_ms(&self, lease: Option<Duration>) -> u64 {
        lease
            .map(|lease| (lease.as_millis() as u64).max(1))
            .unwrap_or_else(|| self.shared.default_lease_ms())
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("lockpoint", &self.lockpoint)
            .field("lock_id", &self.lock_id)
            .field("mode", &self.mode)
            .field("fairness", &self.fairness)
            .field("locked", &self.locked)
            .finish()
    }
}
