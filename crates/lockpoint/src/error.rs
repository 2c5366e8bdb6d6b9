//! Error types for the lock client.

use snafu::Snafu;

/// Errors surfaced by the store boundary.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    /// The store could not be reached, or the call failed in transit.
    ///
    /// Transient by nature, but never retried by the core: the failure is
    /// surfaced to whichever acquire or release was in flight.
    #[snafu(display("store unavailable: {reason}"))]
    Unavailable {
        /// Human-readable description of the transport failure.
        reason: String,
    },

    /// The store does not know the script, e.g. a restart evicted its cache.
    ///
    /// Recovered by re-registering the script once and retrying the call
    /// exactly once; a second miss is fatal.
    #[snafu(display("script '{name}' is not registered with the store"))]
    ScriptMissing {
        /// Name of the unregistered script.
        name: &'static str,
    },

    /// The script failed to compile or raised at runtime. Never retried.
    #[snafu(display("script '{name}' failed: {detail}"))]
    ScriptFailed {
        /// Name of the failing script.
        name: &'static str,
        /// Offending script line, when the store reported one.
        line: Option<u32>,
        /// Error text reported by the store.
        detail: String,
    },

    /// The store closed a notification subscription.
    #[snafu(display("subscription to '{channel}' closed by the store"))]
    SubscriptionClosed {
        /// The channel whose subscription ended.
        channel: String,
    },
}

/// Errors surfaced by lock handles.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LockError {
    /// The underlying store call failed.
    #[snafu(display("store error: {source}"))]
    Store {
        /// The store-boundary failure.
        source: StoreError,
    },

    /// A lock method was invoked on a handle that is already locked.
    #[snafu(display("lock handle for '{lockpoint}' is already held"))]
    AlreadyHeld {
        /// The lockpoint the handle is bound to.
        lockpoint: String,
    },

    /// The acquire script returned a code this client does not understand.
    #[snafu(display("unexpected acquire code {code} for '{lockpoint}'"))]
    UnexpectedCode {
        /// The lockpoint being acquired.
        lockpoint: String,
        /// The undecodable return code.
        code: i64,
    },
}

impl From<StoreError> for LockError {
    fn from(source: StoreError) -> Self {
        LockError::Store { source }
    }
}
