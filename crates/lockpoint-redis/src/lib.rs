//! Redis-backed [`LockStore`] driver.
//!
//! Replaceable glue between the lock core and a real Redis-compatible
//! server: scripts are addressed by SHA1 via `EVALSHA`, re-registered with
//! `SCRIPT LOAD` when the server forgets them, and notification channels
//! are bridged from server pub/sub into the core's subscription feed.
//!
//! ```ignore
//! use lockpoint::{LockClient, LockClientConfig};
//! use lockpoint_redis::RedisLockStore;
//!
//! let store = RedisLockStore::connect("redis://127.0.0.1/").await?;
//! let client = LockClient::new(std::sync::Arc::new(store), LockClientConfig::default());
//! ```

use async_trait::async_trait;
use futures::StreamExt;
use lockpoint::Script;
use lockpoint::StoreError;
use lockpoint::Subscription;
use lockpoint::store::LockStore;
use redis::ErrorKind;
use redis::RedisError;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tracing::trace;
use tracing::warn;

/// A [`LockStore`] speaking to one Redis endpoint.
///
/// Script evaluation rides a multiplexed connection manager; every
/// subscription gets its own pub/sub connection, torn down when the
/// subscription is dropped.
pub struct RedisLockStore {
    client: redis::Client,
    manager: ConnectionManager,
}

impl RedisLockStore {
    /// Connect to a Redis endpoint, e.g. `redis://127.0.0.1/`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(connection_error)?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(connection_error)?;
        Ok(Self { client, manager })
    }

    /// Wrap an existing client and connection manager.
    pub fn new(client: redis::Client, manager: ConnectionManager) -> Self {
        Self { client, manager }
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn eval(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<i64, StoreError> {
        let mut connection = self.manager.clone();
        let mut command = redis::cmd("EVALSHA");
        command.arg(script.sha1_hex()).arg(keys.len());
        for key in keys {
            command.arg(key);
        }
        for arg in args {
            command.arg(arg);
        }
        let code: i64 = command
            .query_async(&mut connection)
            .await
            .map_err(|error| eval_error(script, error))?;
        Ok(code)
    }

    async fn load_script(&self, script: &Script) -> Result<(), StoreError> {
        let mut connection = self.manager.clone();
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(script.source())
            .query_async(&mut connection)
            .await
            .map_err(|error| eval_error(script, error))?;
        if !sha.eq_ignore_ascii_case(script.sha1_hex()) {
            warn!(
                script = script.name(),
                expected = script.sha1_hex(),
                loaded = %sha,
                "server reported an unexpected script digest"
            );
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(connection_error)?;
        pubsub.subscribe(channel).await.map_err(connection_error)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let channel_name = channel.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            loop {
                tokio::select! {
                    message = messages.next() => {
                        let Some(message) = message else { break };
                        let payload: String = match message.get_payload() {
                            Ok(payload) => payload,
                            Err(_) => continue,
                        };
                        if sender.send(payload).is_err() {
                            break;
                        }
                    }
                    _ = sender.closed() => break,
                }
            }
            trace!(channel = channel_name, "pubsub feed ended");
        });
        Ok(Subscription::new(receiver))
    }
}

fn connection_error(error: RedisError) -> StoreError {
    StoreError::Unavailable {
        reason: error.to_string(),
    }
}

fn eval_error(script: &Script, error: RedisError) -> StoreError {
    if error.kind() == ErrorKind::NoScriptError {
        return StoreError::ScriptMissing {
            name: script.name(),
        };
    }
    let detail = error.to_string();
    if detail.contains("user_script") || error.kind() == ErrorKind::ResponseError {
        StoreError::ScriptFailed {
            name: script.name(),
            line: script_error_line(&detail),
            detail,
        }
    } else {
        StoreError::Unavailable { reason: detail }
    }
}

/// Extract the offending line from a server error such as
/// `"ERR Error running script ... user_script:7: attempt to ..."`.
fn script_error_line(detail: &str) -> Option<u32> {
    let start = detail.find("user_script:")? + "user_script:".len();
    let digits: String = detail[start..]
        .chars()
        .take_while(|character| character.is_ascii_digit())
        .collect();
    digits.parse().ok()
}
