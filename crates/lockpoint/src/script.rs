//! Registered store-side scripts and the process-wide script registry.
//!
//! The store executes each script as one indivisible transaction against a
//! lockpoint's keyspace, so no observer ever sees a half-updated key set.
//! Scripts are addressed by the SHA1 digest of their source; the digests are
//! computed once here and the registry is immutable after construction.

use std::sync::LazyLock;

use sha1_smol::Sha1;

/// One registered script: name, source, and the digest the store knows it by.
#[derive(Debug)]
pub struct Script {
    name: &'static str,
    source: &'static str,
    sha1_hex: String,
}

impl Script {
    fn new(name: &'static str, source: &'static str) -> Self {
        let mut digest = Sha1::new();
        digest.update(source.as_bytes());
        Self {
            name,
            source,
            sha1_hex: digest.digest().to_string(),
        }
    }

    /// Script name, used in error reporting and by test stores.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Full script source, registered with the store on demand.
    pub fn source(&self) -> &'static str {
        self.source
    }

    /// Lowercase hex SHA1 digest of the source.
    pub fn sha1_hex(&self) -> &str {
        &self.sha1_hex
    }
}

/// The immutable set of scripts every client shares.
#[derive(Debug)]
pub struct ScriptSet {
    /// State-transition script for lock acquisition.
    pub acquire: Script,
    /// State-transition script for lock release and hand-off.
    pub release: Script,
    /// Watchdog script: expiry detection and hand-off.
    pub refire: Script,
    /// Retraction script removing an abandoned fair waiter.
    pub unqueue: Script,
}

impl ScriptSet {
    /// The process-wide registry, built on first use.
    pub fn global() -> &'static ScriptSet {
        &SCRIPTS
    }

    fn build() -> Self {
        Self {
            acquire: Script::new("acquire", ACQUIRE_SOURCE),
            release: Script::new("release", RELEASE_SOURCE),
            refire: Script::new("refire", REFIRE_SOURCE),
            unqueue: Script::new("unqueue", UNQUEUE_SOURCE),
        }
    }
}

static SCRIPTS: LazyLock<ScriptSet> = LazyLock::new(ScriptSet::build);

/// ACQUIRE
///
/// KEYS: lockpoint, lockcount, lockwait, lockpool.
/// ARGV: channel, name, client_id, lock_id, is_read, is_fair, first_attempt,
/// lease_ms, wait_lease_ms, try_only.
///
/// Returns 0 (granted), -3 (granted as additional shared reader), -2
/// (try-only failure), -1 (failed, no discoverable TTL), or the remaining
/// state TTL in milliseconds.
const ACQUIRE_SOURCE: &str = r#"
local channel = ARGV[1]
local name = ARGV[2]
local token = ARGV[3] .. ':' .. ARGV[4]
local is_read = ARGV[5] == '1'
local is_fair = ARGV[6] == '1'
local first = ARGV[7] == '1'
local lease = tonumber(ARGV[8])
local wait_lease = tonumber(ARGV[9])
local try_only = ARGV[10] == '1'

local function publish_lock()
  redis.call('PUBLISH', channel, 'l:' .. ARGV[3] .. ':' .. ARGV[4] .. ':' .. lease .. ':' .. name)
end

local function grant_write()
  redis.call('SET', KEYS[1], 'unique', 'PX', lease)
  publish_lock()
  return 0
end

local function grant_read_first()
  redis.call('SET', KEYS[1], 'open', 'PX', lease)
  redis.call('SET', KEYS[2], 1, 'PX', lease)
  redis.call('PUBLISH', channel, 'o:' .. name)
  publish_lock()
  return 0
end

local function grant_read_join()
  redis.call('INCR', KEYS[2])
  redis.call('PEXPIRE', KEYS[1], lease)
  redis.call('PEXPIRE', KEYS[2], lease)
  publish_lock()
  return -3
end

local function queued()
  return redis.call('LPOS', KEYS[3], token) ~= false
end

local function pooled()
  return redis.call('SISMEMBER', KEYS[4], token) == 1
end

local state = redis.call('GET', KEYS[1])

if state == false or state == 'dead' then
  if not is_fair then
    if is_read then return grant_read_first() else return grant_write() end
  end
  local head = redis.call('LINDEX', KEYS[3], 0)
  if head == false then
    if is_read then return grant_read_first() else return grant_write() end
  end
  if is_read then
    if head == 'S' and pooled() then
      redis.call('SREM', KEYS[4], token)
      if redis.call('SCARD', KEYS[4]) == 0 then redis.call('LPOP', KEYS[3]) end
      return grant_read_first()
    end
    if not first and not pooled() and not queued() then
      return grant_read_first()
    end
  else
    if head == token then
      redis.call('LPOP', KEYS[3])
      return grant_write()
    end
    if not first and not queued() then
      return grant_write()
    end
  end
elseif state == 'open' and is_read then
  if not is_fair then return grant_read_join() end
  if redis.call('LLEN', KEYS[3]) == 0 then return grant_read_join() end
  if pooled() then
    -- queued behind a pending writer; the shared hand-off wakes us
  elseif not first and not queued() then
    return grant_read_join()
  end
elseif state == 'open' and is_fair and not is_read and not try_only then
  -- a fair writer is now waiting; stop new readers from joining
  redis.call('SET', KEYS[1], 'closed', 'KEEPTTL')
end

if try_only then return -2 end

if is_fair and first then
  if is_read then
    redis.call('SADD', KEYS[4], token)
    if redis.call('LPOS', KEYS[3], 'S') == false then
      redis.call('RPUSH', KEYS[3], 'S')
    end
    redis.call('PEXPIRE', KEYS[4], wait_lease)
  else
    redis.call('RPUSH', KEYS[3], token)
  end
  redis.call('PEXPIRE', KEYS[3], wait_lease)
end

local ttl = redis.call('PTTL', KEYS[1])
if ttl > 0 then return ttl end
return -1
"#;

/// RELEASE
///
/// KEYS: lockpoint, lockcount, lockwait, lockpool.
/// ARGV: channel, name, is_read, is_owner.
///
/// Releasing keys that already expired is a no-op; the refire path owns
/// recovery in that case.
const RELEASE_SOURCE: &str = r#"
local channel = ARGV[1]
local name = ARGV[2]
local is_read = ARGV[3] == '1'
local is_owner = ARGV[4] == '1'

local function handoff()
  local head = redis.call('LINDEX', KEYS[3], 0)
  if head == false then
    redis.call('PUBLISH', channel, '#:' .. name)
  elseif head == 'S' then
    redis.call('LPOP', KEYS[3])
    redis.call('DEL', KEYS[4])
    redis.call('PUBLISH', channel, 's:' .. name)
    redis.call('PUBLISH', channel, 'o:' .. name)
  else
    redis.call('LPOP', KEYS[3])
    redis.call('PUBLISH', channel, 'u:' .. head .. ':' .. name)
  end
end

if is_read then
  if redis.call('EXISTS', KEYS[2]) == 0 then return 0 end
  local remaining = redis.call('DECR', KEYS[2])
  if is_owner and remaining <= 0 then
    redis.call('DEL', KEYS[1])
    redis.call('DEL', KEYS[2])
    handoff()
  end
else
  if redis.call('DEL', KEYS[1]) == 1 then
    handoff()
  end
end
return 0
"#;

/// REFIRE
///
/// KEYS: lockpoint, lockcount, lockwait, lockpool.
/// ARGV: channel, name, default_lease_ms.
///
/// Returns 0 when the expiry was handled here, the remaining TTL in
/// milliseconds when the lease is still running, or -1 when the state key
/// carries no TTL.
const REFIRE_SOURCE: &str = r#"
local channel = ARGV[1]
local name = ARGV[2]

if redis.call('EXISTS', KEYS[1]) == 0 then
  redis.call('DEL', KEYS[2])
  local head = redis.call('LINDEX', KEYS[3], 0)
  if head == false then
    redis.call('SET', KEYS[1], 'dead', 'PX', tonumber(ARGV[3]))
    redis.call('PUBLISH', channel, '#:' .. name)
  elseif head == 'S' then
    redis.call('LPOP', KEYS[3])
    redis.call('DEL', KEYS[4])
    redis.call('PUBLISH', channel, 's:' .. name)
    redis.call('PUBLISH', channel, 'o:' .. name)
  else
    redis.call('LPOP', KEYS[3])
    redis.call('PUBLISH', channel, 'u:' .. head .. ':' .. name)
  end
  return 0
end

local ttl = redis.call('PTTL', KEYS[1])
if ttl > 0 then return ttl end
return -1
"#;

/// UNQUEUE
///
/// KEYS: lockwait, lockpool. ARGV: token.
///
/// Retracts an abandoned fair waiter; removing the last pooled shared
/// waiter also removes the batch marker.
const UNQUEUE_SOURCE: &str = r#"
redis.call('LREM', KEYS[1], 0, ARGV[1])
if redis.call('SREM', KEYS[2], ARGV[1]) == 1 then
  if redis.call('SCARD', KEYS[2]) == 0 then
    redis.call('LREM', KEYS[1], 0, 'S')
  end
end
return 0
"#;
