//! Protocol constants shared by the scripts, the coordinator, and the stores.

/// Default lease attached to a granted lock, in milliseconds.
///
/// A holder that crashes without unlocking stops being observable as a
/// holder once this lease expires.
pub const DEFAULT_LEASE_MS: u64 = 30_000;

/// Default TTL for the fair wait-queue structures, in milliseconds.
///
/// Queue entries from abandoned processes disappear after this long even
/// when the retraction script never ran.
pub const DEFAULT_WAIT_LEASE_MS: u64 = 300_000;

/// Default key prefix for all lockpoint keys and channels.
pub const DEFAULT_KEY_PREFIX: &str = "lockpoint";

/// Separator between the client id and the lock id in a waiter token.
pub const TOKEN_SEPARATOR: char = ':';

/// Wait-queue marker standing in for a batch of shared waiters.
///
/// At most one marker is ever present in a queue; shared waiters arriving
/// behind a second queued writer coalesce into the existing batch.
pub const SHARED_BATCH_MARKER: &str = "S";

/// State value for an exclusively held lockpoint.
pub const STATE_UNIQUE: &str = "unique";

/// State value for a lockpoint held by one or more readers.
pub const STATE_OPEN: &str = "open";

/// State value while a fair writer waits for readers to drain.
pub const STATE_CLOSED: &str = "closed";

/// Sentinel written by a refire when a lease expired with no successor.
///
/// Acquire treats this state exactly like an absent key; the sentinel
/// carries its own TTL so it self-expires.
pub const STATE_DEAD: &str = "dead";
