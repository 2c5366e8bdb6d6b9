//! Key and channel generation for the per-lockpoint keyspace.

use crate::constants::TOKEN_SEPARATOR;

/// The four store keys backing one lockpoint.
///
/// Handed to the scripts in this order: state, count, wait list, pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockKeys {
    /// State key: absent, "unique", "open", "closed", or "dead".
    pub lockpoint: String,
    /// Shared-holder counter, present iff the state is "open".
    pub lockcount: String,
    /// FIFO wait list for fair mode.
    pub lockwait: String,
    /// Set of shared waiters queued behind a pending fair writer.
    pub lockpool: String,
}

impl LockKeys {
    /// Build the keyspace for a lockpoint under the given prefix.
    pub fn new(prefix: &str, name: &str) -> Self {
        debug_assert!(!name.is_empty(), "lockpoint name must not be empty");

        Self {
            lockpoint: format!("{prefix}:lockpoint:{name}"),
            lockcount: format!("{prefix}:lockcount:{name}"),
            lockwait: format!("{prefix}:lockwait:{name}"),
            lockpool: format!("{prefix}:lockpool:{name}"),
        }
    }

    /// The keys as a slice-friendly vector, in script argument order.
    pub fn to_vec(&self) -> Vec<String> {
        vec![
            self.lockpoint.clone(),
            self.lockcount.clone(),
            self.lockwait.clone(),
            self.lockpool.clone(),
        ]
    }
}

/// The notification channel for a lockpoint.
pub fn channel(prefix: &str, name: &str) -> String {
    format!("{prefix}:lockchannel:{name}")
}

/// The wait-queue token identifying one pending attempt.
pub fn waiter_token(client_id: &str, lock_id: u64) -> String {
    format!("{client_id}{TOKEN_SEPARATOR}{lock_id}")
}
