//! Server-evaluated commands
//!
//! Every conditional write, every write+publish combinator and the lock
//! primitives run as one Lua script on the store, so no other client can
//! observe a partial outcome: a failed guard neither writes nor publishes.
//!
//! ## Argument Layout
//! ```text
//! set_if                          KEYS: key        ARGV: new, old
//! remove_if                       KEYS: key        ARGV: expected
//! set_and_publish                 KEYS: k1..kn     ARGV: v1..vn, ch, ev, ch, ev ...
//! set_if_and_publish              KEYS: key        ARGV: new, old, ch, ev ...
//! set_if_not_exists_and_publish   KEYS: key        ARGV: data, ch, ev ...
//! remove_and_publish              KEYS: k1..kn     ARGV: ch, ev ...
//! remove_if_and_publish           KEYS: key        ARGV: expected, ch, ev ...
//! lock_release                    KEYS: lock       ARGV: token
//! lock_refresh                    KEYS: lock       ARGV: token, millis
//! lock_validity                   KEYS: lock       ARGV: token
//! ```
//! Each returns 1 when the mutation took effect and 0 otherwise, except
//! `lock_validity` which returns the remaining milliseconds or a negative
//! error code.

use redis::{Script, ScriptInvocation};

const SET_IF: &str = r#"
local current = redis.call('GET', KEYS[1])
if current and current == ARGV[2] then
    redis.call('SET', KEYS[1], ARGV[1])
    return 1
end
return 0
"#;

const REMOVE_IF: &str = r#"
local current = redis.call('GET', KEYS[1])
if current and current == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const SET_AND_PUBLISH: &str = r#"
for i = 1, #KEYS do
    redis.call('SET', KEYS[i], ARGV[i])
end
for i = #KEYS + 1, #ARGV, 2 do
    redis.call('PUBLISH', ARGV[i], ARGV[i + 1])
end
return 1
"#;

const SET_IF_AND_PUBLISH: &str = r#"
local current = redis.call('GET', KEYS[1])
if current and current == ARGV[2] then
    redis.call('SET', KEYS[1], ARGV[1])
    for i = 3, #ARGV, 2 do
        redis.call('PUBLISH', ARGV[i], ARGV[i + 1])
    end
    return 1
end
return 0
"#;

const SET_IF_NOT_EXISTS_AND_PUBLISH: &str = r#"
if redis.call('SETNX', KEYS[1], ARGV[1]) == 1 then
    for i = 2, #ARGV, 2 do
        redis.call('PUBLISH', ARGV[i], ARGV[i + 1])
    end
    return 1
end
return 0
"#;

const REMOVE_AND_PUBLISH: &str = r#"
for i = 1, #KEYS do
    redis.call('DEL', KEYS[i])
end
for i = 1, #ARGV, 2 do
    redis.call('PUBLISH', ARGV[i], ARGV[i + 1])
end
return 1
"#;

const REMOVE_IF_AND_PUBLISH: &str = r#"
local current = redis.call('GET', KEYS[1])
if current and current == ARGV[1] then
    redis.call('DEL', KEYS[1])
    for i = 2, #ARGV, 2 do
        redis.call('PUBLISH', ARGV[i], ARGV[i + 1])
    end
    return 1
end
return 0
"#;

const LOCK_RELEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const LOCK_REFRESH: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const LOCK_VALIDITY: &str = r#"
local token = redis.call('GET', KEYS[1])
if not token then
    return -10
end
if token ~= ARGV[1] then
    return -11
end
return redis.call('PTTL', KEYS[1])
"#;

/// `lock_validity` result: the lock key does not exist
pub const LOCK_NOT_HELD: i64 = -10;

/// `lock_validity` result: the lock key holds another token
pub const LOCK_HELD_BY_OTHER: i64 = -11;

/// Compiled scripts, built once per backend and shared by every shard
///
/// `Script` caches the SHA1 of its source and falls back to a full `EVAL`
/// when the store does not know the script yet.
pub struct Scripts {
    pub set_if: Script,
    pub remove_if: Script,
    pub set_and_publish: Script,
    pub set_if_and_publish: Script,
    pub set_if_not_exists_and_publish: Script,
    pub remove_and_publish: Script,
    pub remove_if_and_publish: Script,
    pub lock_release: Script,
    pub lock_refresh: Script,
    pub lock_validity: Script,
}

impl Scripts {
    pub fn new() -> Self {
        Self {
            set_if: Script::new(SET_IF),
            remove_if: Script::new(REMOVE_IF),
            set_and_publish: Script::new(SET_AND_PUBLISH),
            set_if_and_publish: Script::new(SET_IF_AND_PUBLISH),
            set_if_not_exists_and_publish: Script::new(SET_IF_NOT_EXISTS_AND_PUBLISH),
            remove_and_publish: Script::new(REMOVE_AND_PUBLISH),
            remove_if_and_publish: Script::new(REMOVE_IF_AND_PUBLISH),
            lock_release: Script::new(LOCK_RELEASE),
            lock_refresh: Script::new(LOCK_REFRESH),
            lock_validity: Script::new(LOCK_VALIDITY),
        }
    }
}

impl Default for Scripts {
    fn default() -> Self {
        Self::new()
    }
}

/// Append prepared channel/payload pairs to a script's arguments
pub fn push_channels(invocation: &mut ScriptInvocation<'_>, prepared: &[(String, String)]) {
    for (channel, payload) in prepared {
        invocation.arg(channel).arg(payload);
    }
}
