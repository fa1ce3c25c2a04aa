//! Server-side Lua scripts.
//!
//! Every script takes the waiting set as `KEYS[1]` and the enterable set as
//! `KEYS[2]`. Join and membership also take the arrivals hash (user ->
//! arrival ms of their latest join) as `KEYS[3]`. All keys share the
//! `{queue_id}` hash tag, so each script touches a single cluster slot.
//!
//! Scores are integer milliseconds. Multi-value replies are flat integer
//! arrays whose first element is a status code.

use redis::Script;

/// Insert into waiting unless waiting or validly granted.
///
/// ARGV: user, `now_ms`.
/// Reply: `{0, rank}` joined, `{1, rank}` already waiting,
/// `{2, expires_ms}` already granted.
const JOIN: &str = r"
local grant = redis.call('ZSCORE', KEYS[2], ARGV[1])
if grant then
    if tonumber(grant) > tonumber(ARGV[2]) then
        return {2, tonumber(grant)}
    end
    redis.call('ZREM', KEYS[2], ARGV[1])
end

local rank = redis.call('ZRANK', KEYS[1], ARGV[1])
if rank then
    return {1, rank}
end

local score = tonumber(ARGV[2])
local tail = redis.call('ZRANGE', KEYS[1], -1, -1, 'WITHSCORES')
if tail[2] then
    local after_tail = tonumber(tail[2]) + 1
    if after_tail > score then
        score = after_tail
    end
end

redis.call('ZADD', KEYS[1], score, ARGV[1])
redis.call('HSET', KEYS[3], ARGV[1], score)
return {0, redis.call('ZRANK', KEYS[1], ARGV[1])}
";

/// Capacity-checked move from waiting to enterable.
///
/// ARGV: user, `expires_ms`, `now_ms`, capacity.
/// Reply: `{1, arrival_ms}` moved, `{0, 0}` skipped, `{-1, 0}` full.
const PROMOTE: &str = r"
local arrival = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not arrival then
    return {0, 0}
end

local active = redis.call('ZCOUNT', KEYS[2], '(' .. ARGV[3], '+inf')
if active >= tonumber(ARGV[4]) then
    return {-1, 0}
end

redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
return {1, tonumber(arrival)}
";

/// Undo a promotion, but only while the grant is still held.
///
/// ARGV: user, `arrival_ms`.
/// Reply: 1 if re-inserted into waiting.
const REQUEUE: &str = r"
if redis.call('ZREM', KEYS[2], ARGV[1]) == 0 then
    return 0
end
return redis.call('ZADD', KEYS[1], 'NX', ARGV[2], ARGV[1])
";

/// Remove from both sets.
///
/// ARGV: user.
/// Reply: `{left_waiting}` or `{left_waiting, revoked_expires_ms}`.
const LEAVE: &str = r"
local left = redis.call('ZREM', KEYS[1], ARGV[1])
local grant = redis.call('ZSCORE', KEYS[2], ARGV[1])
if grant then
    redis.call('ZREM', KEYS[2], ARGV[1])
    return {left, tonumber(grant)}
end
return {left}
";

/// Consistent membership read.
///
/// ARGV: user.
/// Reply: `{2, expires_ms}` granted, `{1, rank}` waiting, `{0}` absent.
/// Granted and absent replies carry the latest join's `arrival_ms` as a
/// trailing element when one is on record.
const MEMBERSHIP: &str = r"
local reply = {0}
local grant = redis.call('ZSCORE', KEYS[2], ARGV[1])
if grant then
    reply = {2, tonumber(grant)}
else
    local rank = redis.call('ZRANK', KEYS[1], ARGV[1])
    if rank then
        return {1, rank}
    end
end
local arrival = redis.call('HGET', KEYS[3], ARGV[1])
if arrival then
    table.insert(reply, tonumber(arrival))
end
return reply
";

/// Extend a lease if the caller still owns it.
///
/// KEYS: lease key. ARGV: token, `ttl_ms`. Reply: 1 if extended.
const RENEW_LEASE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
";

/// Delete a lease if the caller still owns it.
///
/// KEYS: lease key. ARGV: token. Reply: 1 if deleted.
const RELEASE_LEASE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// Compiled queue scripts (hashes computed once).
pub(crate) struct QueueScripts {
    pub(crate) join: Script,
    pub(crate) promote: Script,
    pub(crate) requeue: Script,
    pub(crate) leave: Script,
    pub(crate) membership: Script,
}

impl QueueScripts {
    pub(crate) fn load() -> Self {
        Self {
            join: Script::new(JOIN),
            promote: Script::new(PROMOTE),
            requeue: Script::new(REQUEUE),
            leave: Script::new(LEAVE),
            membership: Script::new(MEMBERSHIP),
        }
    }
}

/// Compiled lease scripts.
pub(crate) struct LeaseScripts {
    pub(crate) renew: Script,
    pub(crate) release: Script,
}

impl LeaseScripts {
    pub(crate) fn load() -> Self {
        Self {
            renew: Script::new(RENEW_LEASE),
            release: Script::new(RELEASE_LEASE),
        }
    }
}
