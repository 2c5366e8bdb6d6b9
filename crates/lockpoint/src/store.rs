//! The store boundary.
//!
//! Everything the lock core needs from the shared store fits in one trait:
//! atomic execution of registered scripts, script (re-)registration, and
//! best-effort channel subscriptions. All key mutation and publishing
//! happens inside the scripts, so the trait has no plain read/write
//! surface.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::StoreError;
use crate::script::Script;

/// A live subscription to one notification channel.
///
/// Dropping the subscription is the unsubscribe: backends notice the closed
/// receiver and stop forwarding.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<String>,
}

impl Subscription {
    /// Wrap a backend's message feed.
    pub fn new(receiver: mpsc::UnboundedReceiver<String>) -> Self {
        Self { receiver }
    }

    /// Next raw payload, or `None` once the backend closed the channel.
    pub async fn next_message(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

/// Capabilities the lock protocol requires from the shared store.
#[async_trait]
pub trait LockStore: Send + Sync + 'static {
    /// Execute a registered script atomically.
    ///
    /// Returns the script's integer reply. A store that no longer knows the
    /// script must fail with [`StoreError::ScriptMissing`] so the caller
    /// can re-register and retry.
    async fn eval(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<i64, StoreError>;

    /// (Re-)register a script with the store.
    async fn load_script(&self, script: &Script) -> Result<(), StoreError>;

    /// Open a subscription to a notification channel.
    ///
    /// Must be established before the subscriber's next acquire attempt is
    /// sent; messages published after this call returns are delivered.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;
}
