//! Typed wrappers around the atomic lock scripts.
//!
//! Each wrapper is a single fire-and-forget round trip to the store; none
//! of them blocks on other local waiters. A script the store no longer
//! knows is re-registered once and the call retried exactly once; a second
//! miss surfaces as fatal.

use std::sync::Arc;

use tracing::debug;

use crate::error::StoreError;
use crate::keys;
use crate::keys::LockKeys;
use crate::script::Script;
use crate::script::ScriptSet;
use crate::store::LockStore;

/// Decoded result of one acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireCode {
    /// Granted: exclusive, or the first shared holder (the owner).
    Granted,
    /// Granted as an additional shared reader.
    GrantedShared,
    /// Held elsewhere; the state key has this many milliseconds of lease
    /// left, which bounds how long a wake is worth waiting for.
    Busy {
        /// Remaining lease on the state key, in milliseconds.
        remaining_ms: u64,
    },
    /// Held elsewhere with no discoverable TTL; poll again after the
    /// default lease.
    NoTtl,
    /// Try-only attempt failed; nothing was queued.
    TryFailed,
}

/// Decoded result of one refire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefireCode {
    /// The expiry was handled now; no reschedule needed.
    Handled,
    /// Lease still running; fire again after this many milliseconds.
    Reschedule {
        /// Remaining lease on the state key, in milliseconds.
        remaining_ms: u64,
    },
    /// State key present with no TTL; poll again after the default lease.
    Poll,
}

/// One pending acquire attempt, as handed to the store.
#[derive(Debug, Clone)]
pub struct AcquireRequest<'a> {
    /// The lockpoint being acquired.
    pub name: &'a str,
    /// Process-unique id of this attempt.
    pub lock_id: u64,
    /// Shared (read) rather than exclusive (write) access.
    pub is_read: bool,
    /// FIFO queueing semantics.
    pub is_fair: bool,
    /// First round trip of this attempt; retries must not re-enqueue.
    pub first_attempt: bool,
    /// Lease granted on success, in milliseconds.
    pub lease_ms: u64,
    /// TTL stamped on the wait structures when queuing, in milliseconds.
    pub wait_lease_ms: u64,
    /// Fail immediately instead of queuing.
    pub try_only: bool,
}

/// Shared executor for the four lock scripts.
#[derive(Clone)]
pub struct LockOps {
    store: Arc<dyn LockStore>,
    scripts: &'static ScriptSet,
    prefix: Arc<str>,
    client_id: Arc<str>,
}

impl LockOps {
    /// Build an executor bound to one client identity and key prefix.
    pub fn new(
        store: Arc<dyn LockStore>,
        scripts: &'static ScriptSet,
        prefix: Arc<str>,
        client_id: Arc<str>,
    ) -> Self {
        debug_assert!(!client_id.is_empty(), "client id must not be empty");
        Self {
            store,
            scripts,
            prefix,
            client_id,
        }
    }

    /// The id this process signs waiter tokens and grants with.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The key prefix all lockpoint keys live under.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// One acquire round trip.
    pub async fn acquire(&self, request: &AcquireRequest<'_>) -> Result<AcquireCode, StoreError> {
        debug_assert!(request.lease_ms > 0, "lease must be positive");

        let keys = LockKeys::new(&self.prefix, request.name).to_vec();
        let args = vec![
            keys::channel(&self.prefix, request.name),
            request.name.to_string(),
            self.client_id.to_string(),
            request.lock_id.to_string(),
            flag(request.is_read),
            flag(request.is_fair),
            flag(request.first_attempt),
            request.lease_ms.to_string(),
            request.wait_lease_ms.to_string(),
            flag(request.try_only),
        ];

        let code = self.eval_reloading(&self.scripts.acquire, &keys, &args).await?;
        let decoded = match code {
            0 => AcquireCode::Granted,
            -3 => AcquireCode::GrantedShared,
            -2 => AcquireCode::TryFailed,
            -1 => AcquireCode::NoTtl,
            ms if ms > 0 => AcquireCode::Busy {
                remaining_ms: ms as u64,
            },
            other => {
                return Err(StoreError::ScriptFailed {
                    name: self.scripts.acquire.name(),
                    line: None,
                    detail: format!("unexpected return code {other}"),
                });
            }
        };
        debug!(
            lockpoint = request.name,
            lock_id = request.lock_id,
            code,
            "acquire attempt"
        );
        Ok(decoded)
    }

    /// One release round trip.
    pub async fn release(
        &self,
        name: &str,
        is_read: bool,
        is_owner: bool,
    ) -> Result<(), StoreError> {
        let keys = LockKeys::new(&self.prefix, name).to_vec();
        let args = vec![
            keys::channel(&self.prefix, name),
            name.to_string(),
            flag(is_read),
            flag(is_owner),
        ];
        self.eval_reloading(&self.scripts.release, &keys, &args).await?;
        debug!(lockpoint = name, is_read, is_owner, "released");
        Ok(())
    }

    /// One refire round trip, on behalf of the watchdog.
    pub async fn refire(&self, name: &str, default_lease_ms: u64) -> Result<RefireCode, StoreError> {
        let keys = LockKeys::new(&self.prefix, name).to_vec();
        let args = vec![
            keys::channel(&self.prefix, name),
            name.to_string(),
            default_lease_ms.to_string(),
        ];
        let code = self.eval_reloading(&self.scripts.refire, &keys, &args).await?;
        match code {
            0 => Ok(RefireCode::Handled),
            -1 => Ok(RefireCode::Poll),
            ms if ms > 0 => Ok(RefireCode::Reschedule {
                remaining_ms: ms as u64,
            }),
            other => Err(StoreError::ScriptFailed {
                name: self.scripts.refire.name(),
                line: None,
                detail: format!("unexpected return code {other}"),
            }),
        }
    }

    /// Retract an abandoned fair waiter from the store-side queue.
    pub async fn unqueue(&self, name: &str, lock_id: u64) -> Result<(), StoreError> {
        let all = LockKeys::new(&self.prefix, name);
        let keys = vec![all.lockwait, all.lockpool];
        let args = vec![keys::waiter_token(&self.client_id, lock_id)];
        self.eval_reloading(&self.scripts.unqueue, &keys, &args).await?;
        debug!(lockpoint = name, lock_id, "unqueued abandoned waiter");
        Ok(())
    }

    /// Evaluate, recovering once from a store that lost the script.
    async fn eval_reloading(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<i64, StoreError> {
        match self.store.eval(script, keys, args).await {
            Err(StoreError::ScriptMissing { .. }) => {
                debug!(script = script.name(), "re-registering evicted script");
                self.store.load_script(script).await?;
                self.store.eval(script, keys, args).await
            }
            other => other,
        }
    }
}

fn flag(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}
