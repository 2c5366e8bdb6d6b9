//! Minimal store stub for this crate's own unit tests.
//!
//! Only what the wake and watchdog tests need: scripted eval replies, a
//! call log, and channel fan-out. The full protocol-faithful store lives in
//! the `lockpoint-testing` crate and is used by the integration tests; it
//! cannot back unit tests here because its trait impls target the
//! separately compiled library crate.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::StoreError;
use crate::script::Script;
use crate::store::LockStore;
use crate::store::Subscription;

/// A store whose eval replies are scripted by the test.
pub(crate) struct StubStore {
    replies: Mutex<VecDeque<Result<i64, StoreError>>>,
    calls: Mutex<Vec<String>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>,
}

impl StubStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            subscribers: Mutex::new(HashMap::new()),
        })
    }

    /// Queue the reply for the next eval; defaults to `Ok(0)` when empty.
    pub(crate) fn push_reply(&self, reply: Result<i64, StoreError>) {
        self.replies.lock().push_back(reply);
    }

    /// Names of the scripts evaluated so far, in order.
    pub(crate) fn evaluated(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Publish a raw payload to a channel's subscribers.
    pub(crate) fn publish(&self, channel: &str, payload: &str) {
        if let Some(senders) = self.subscribers.lock().get_mut(channel) {
            senders.retain(|sender| sender.send(payload.to_string()).is_ok());
        }
    }

    /// Number of open subscriptions on a channel.
    pub(crate) fn subscriber_count(&self, channel: &str) -> usize {
        let mut subscribers = self.subscribers.lock();
        if let Some(senders) = subscribers.get_mut(channel) {
            senders.retain(|sender| !sender.is_closed());
        }
        subscribers.get(channel).map(Vec::len).unwrap_or_default()
    }
}

#[async_trait]
impl LockStore for StubStore {
    async fn eval(
        &self,
        script: &Script,
        _keys: &[String],
        _args: &[String],
    ) -> Result<i64, StoreError> {
        self.calls.lock().push(script.name().to_string());
        self.replies.lock().pop_front().unwrap_or(Ok(0))
    }

    async fn load_script(&self, _script: &Script) -> Result<(), StoreError> {
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(sender);
        Ok(Subscription::new(receiver))
    }
}
