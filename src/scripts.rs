//! Server-side compare-and-act programs.
//!
//! Every mutation that depends on the current key value runs as a single Lua
//! script so that a stale holder whose lease already expired cannot damage a
//! fresh owner's state. The conditional set itself needs no script: it is the
//! plain `SET key token NX PX ttl` command.

/// Lua script for releasing a lock key.
///
/// KEYS\[1\] = lock key
/// ARGV\[1\] = ownership token
///
/// Returns 1 if the key was deleted, 0 if it is not held by this token.
pub(crate) const RELEASE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("DEL", KEYS[1])
else
  return 0
end
"#;

/// Lua script for refreshing a lock key's expiry.
///
/// KEYS\[1\] = lock key
/// ARGV\[1\] = ownership token
/// ARGV\[2\] = new TTL in milliseconds
///
/// Returns 1 if the expiry was reset, 0 if the key is not held by this token.
pub(crate) const EXTEND: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
  return 0
end
"#;

/// Lua script for reading a lock key's remaining lifetime.
///
/// KEYS\[1\] = lock key
/// ARGV\[1\] = ownership token
///
/// Returns the remaining TTL in milliseconds, or nil if the key is not held
/// by this token.
pub(crate) const REMAINING: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("PTTL", KEYS[1])
else
  return nil
end
"#;
