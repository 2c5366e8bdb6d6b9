//! Distributed read-write locks over a scripted, leased key-value store.
//!
//! Many independent processes coordinate exclusive and shared access to
//! named resources ("lockpoints") without a central coordinator. The store
//! provides three capabilities: atomic server-side scripts, key expiry
//! (leases), and a best-effort pub/sub channel per lockpoint. On top of
//! those this crate layers:
//!
//! - Atomic state transitions (acquire / release / refire) executed as
//!   registered scripts against a small per-lockpoint keyspace.
//! - A per-process wake coordinator that turns channel notifications into
//!   thread wake-ups with fair or unfair semantics.
//! - A lease-renewal watchdog that re-polls expiring leases, so a crashed
//!   holder or a dropped notification only ever costs latency.
//! - Lock handles with `lock` / `try_lock` / bounded-wait variants and
//!   per-acquisition lease overrides.
//!
//! Mutual exclusion holds within one consistent store endpoint with
//! working lease expiry. This is not a consensus protocol: there is no
//! quorum and no protection across store partitions or failover.
//!
//! # Example
//!
//! ```ignore
//! use lockpoint::{Fairness, LockClient, LockClientConfig};
//!
//! let client = LockClient::new(store, LockClientConfig::default());
//! let mut lock = client.rwlock("orders", Fairness::Fair);
//!
//! lock.write().lock().await?;
//! // exclusive critical section
//! lock.write().unlock().await?;
//! ```

pub mod constants;
pub mod error;
pub mod keys;
pub mod ops;
pub mod script;
pub mod store;
pub mod wire;

mod client;
mod handle;
#[cfg(test)]
mod test_support;
mod wake;
mod watchdog;

pub use client::DistributedRwLock;
pub use client::LockClient;
pub use client::LockClientConfig;
pub use error::LockError;
pub use error::StoreError;
pub use handle::Fairness;
pub use handle::LockHandle;
pub use handle::LockMode;
pub use ops::AcquireCode;
pub use ops::AcquireRequest;
pub use ops::LockOps;
pub use ops::RefireCode;
pub use script::Script;
pub use script::ScriptSet;
pub use store::LockStore;
pub use store::Subscription;
pub use wire::Notification;
