//! Lua scripts run atomically inside Redis. Each one is the store-side half of
//! a `QueueBackend` method.
//!
//! Job hashes live at `{job_prefix}{id}`; the prefix is always `ARGV[1]`.
//! Owner writes answer with a status-first array: `{'ok', field, value, ...}`,
//! `{'missing'}` or `{'lost'}`.

use redis::Script;

const ENQUEUE: &str = r#"
local seq = redis.call('INCR', KEYS[1])
local job_id = tostring(seq)
local job_key = ARGV[1] .. job_id
local score = string.format('%.0f', tonumber(ARGV[3]) * 4294967296 + seq)
local delay = tonumber(ARGV[4])

redis.call('HSET', job_key,
    'id', job_id, 'score', score, 'payload', ARGV[2], 'priority', ARGV[3],
    'delay', ARGV[4], 'max_attempts', ARGV[5], 'backoff', ARGV[6],
    'progress', '0', 'attempts_made', '0', 'stalled_count', '0', 'created_at', ARGV[7])

if delay > 0 then
    local ready_at = string.format('%.0f', tonumber(ARGV[7]) + delay)
    redis.call('HSET', job_key, 'state', 'delayed', 'ready_at', ready_at)
    redis.call('ZADD', KEYS[3], ready_at, job_id)
else
    redis.call('HSET', job_key, 'state', 'waiting')
    redis.call('ZADD', KEYS[2], score, job_id)
end

return redis.call('HGETALL', job_key)
"#;

const CLAIM: &str = r#"
local now = tonumber(ARGV[2])

local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[2])
for _, id in ipairs(due) do
    redis.call('ZREM', KEYS[2], id)
    local job_key = ARGV[1] .. id
    local score = redis.call('HGET', job_key, 'score')
    if score then
        redis.call('HSET', job_key, 'state', 'waiting')
        redis.call('ZADD', KEYS[1], score, id)
    end
end

if redis.call('EXISTS', KEYS[4]) == 1 then
    return {}
end

local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then
    return {}
end

local id = popped[1]
local job_key = ARGV[1] .. id
if redis.call('EXISTS', job_key) == 0 then
    return {}
end

local lease_until = string.format('%.0f', now + tonumber(ARGV[3]))
redis.call('HINCRBY', job_key, 'attempts_made', 1)
redis.call('HSETNX', job_key, 'processed_on', ARGV[2])
redis.call('HSET', job_key, 'state', 'active', 'progress', '0', 'lease_token', ARGV[4], 'lease_until', lease_until)
redis.call('ZADD', KEYS[3], lease_until, id)

return redis.call('HGETALL', job_key)
"#;

const EXTEND_LEASE: &str = r#"
local job_key = ARGV[1] .. ARGV[2]
if redis.call('EXISTS', job_key) == 0 then return {'missing'} end
if redis.call('HGET', job_key, 'lease_token') ~= ARGV[3] then return {'lost'} end

local lease_until = string.format('%.0f', tonumber(ARGV[4]) + tonumber(ARGV[5]))
redis.call('HSET', job_key, 'lease_until', lease_until)
redis.call('ZADD', KEYS[1], lease_until, ARGV[2])
return {'ok', lease_until}
"#;

const UPDATE_PROGRESS: &str = r#"
local job_key = ARGV[1] .. ARGV[2]
if redis.call('EXISTS', job_key) == 0 then return {'missing'} end
if redis.call('HGET', job_key, 'lease_token') ~= ARGV[3] then return {'lost'} end

local current = tonumber(redis.call('HGET', job_key, 'progress') or '0')
if tonumber(ARGV[4]) < current then
    return {'regressed', tostring(current)}
end

redis.call('HSET', job_key, 'progress', ARGV[4])
local out = {'ok'}
for _, v in ipairs(redis.call('HGETALL', job_key)) do table.insert(out, v) end
return out
"#;

const COMPLETE: &str = r#"
local job_key = ARGV[1] .. ARGV[2]
if redis.call('EXISTS', job_key) == 0 then return {'missing'} end
if redis.call('HGET', job_key, 'lease_token') ~= ARGV[3] then return {'lost'} end

redis.call('ZREM', KEYS[1], ARGV[2])
redis.call('HDEL', job_key, 'lease_token', 'lease_until')
redis.call('HSET', job_key, 'state', 'completed', 'finished_on', ARGV[4], 'return_value', ARGV[5])
redis.call('ZADD', KEYS[2], ARGV[4], ARGV[2])

local out = {'ok'}
for _, v in ipairs(redis.call('HGETALL', job_key)) do table.insert(out, v) end

local keep = tonumber(ARGV[6])
if keep >= 0 then
    local excess = redis.call('ZCARD', KEYS[2]) - keep
    if excess > 0 then
        for _, old in ipairs(redis.call('ZRANGE', KEYS[2], 0, excess - 1)) do
            redis.call('DEL', ARGV[1] .. old)
        end
        redis.call('ZREMRANGEBYRANK', KEYS[2], 0, excess - 1)
    end
end

return out
"#;

const FAIL: &str = r#"
local job_key = ARGV[1] .. ARGV[2]
if redis.call('EXISTS', job_key) == 0 then return {'missing'} end
if redis.call('HGET', job_key, 'lease_token') ~= ARGV[3] then return {'lost'} end

redis.call('ZREM', KEYS[1], ARGV[2])
redis.call('HDEL', job_key, 'lease_token', 'lease_until')

local retry_at = tonumber(ARGV[6])
if retry_at >= 0 then
    if retry_at > tonumber(ARGV[4]) then
        redis.call('HSET', job_key, 'state', 'delayed', 'ready_at', ARGV[6])
        redis.call('ZADD', KEYS[2], ARGV[6], ARGV[2])
    else
        redis.call('HSET', job_key, 'state', 'waiting')
        redis.call('ZADD', KEYS[3], redis.call('HGET', job_key, 'score'), ARGV[2])
    end
else
    redis.call('HSET', job_key, 'state', 'failed', 'failed_reason', ARGV[5], 'finished_on', ARGV[4])
    redis.call('ZADD', KEYS[4], ARGV[4], ARGV[2])
end

local out = {'ok'}
for _, v in ipairs(redis.call('HGETALL', job_key)) do table.insert(out, v) end

local keep = tonumber(ARGV[7])
if retry_at < 0 and keep >= 0 then
    local excess = redis.call('ZCARD', KEYS[4]) - keep
    if excess > 0 then
        for _, old in ipairs(redis.call('ZRANGE', KEYS[4], 0, excess - 1)) do
            redis.call('DEL', ARGV[1] .. old)
        end
        redis.call('ZREMRANGEBYRANK', KEYS[4], 0, excess - 1)
    end
end

return out
"#;

const RELEASE: &str = r#"
local job_key = ARGV[1] .. ARGV[2]
if redis.call('EXISTS', job_key) == 0 then return 0 end
if redis.call('HGET', job_key, 'lease_token') ~= ARGV[3] then return 0 end

redis.call('ZREM', KEYS[1], ARGV[2])
redis.call('HDEL', job_key, 'lease_token', 'lease_until')
redis.call('HSET', job_key, 'state', 'waiting')
redis.call('ZADD', KEYS[2], redis.call('HGET', job_key, 'score'), ARGV[2])
return 1
"#;

const REQUEUE_STALLED: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[2])
local requeued = {}
local failed = {}

for _, id in ipairs(expired) do
    redis.call('ZREM', KEYS[1], id)
    local job_key = ARGV[1] .. id
    if redis.call('EXISTS', job_key) == 1 then
        local stalled = redis.call('HINCRBY', job_key, 'stalled_count', 1)
        redis.call('HDEL', job_key, 'lease_token', 'lease_until')
        if stalled > tonumber(ARGV[3]) then
            redis.call('HSET', job_key, 'state', 'failed', 'failed_reason', ARGV[5], 'finished_on', ARGV[2])
            redis.call('ZADD', KEYS[3], ARGV[2], id)
            table.insert(failed, id)
        else
            redis.call('HSET', job_key, 'state', 'waiting')
            redis.call('ZADD', KEYS[2], redis.call('HGET', job_key, 'score'), id)
            table.insert(requeued, id)
        end
    end
end

local keep = tonumber(ARGV[4])
if #failed > 0 and keep >= 0 then
    local excess = redis.call('ZCARD', KEYS[3]) - keep
    if excess > 0 then
        for _, old in ipairs(redis.call('ZRANGE', KEYS[3], 0, excess - 1)) do
            redis.call('DEL', ARGV[1] .. old)
        end
        redis.call('ZREMRANGEBYRANK', KEYS[3], 0, excess - 1)
    end
end

return {requeued, failed}
"#;

const REMOVE: &str = r#"
local removed = redis.call('DEL', ARGV[1] .. ARGV[2])
for i = 1, #KEYS do
    redis.call('ZREM', KEYS[i], ARGV[2])
end
return removed
"#;

const CLEAN: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[2])
for _, id in ipairs(ids) do
    redis.call('DEL', ARGV[1] .. id)
end
if #ids > 0 then
    redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[2])
end
return #ids
"#;

/// Scripts are hashed once and sent by SHA, falling back to EVAL on a cold
/// script cache.
pub(super) struct Scripts {
    pub enqueue: Script,
    pub claim: Script,
    pub extend_lease: Script,
    pub update_progress: Script,
    pub complete: Script,
    pub fail: Script,
    pub release: Script,
    pub requeue_stalled: Script,
    pub remove: Script,
    pub clean: Script,
}

impl Scripts {
    pub fn load() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE),
            claim: Script::new(CLAIM),
            extend_lease: Script::new(EXTEND_LEASE),
            update_progress: Script::new(UPDATE_PROGRESS),
            complete: Script::new(COMPLETE),
            fail: Script::new(FAIL),
            release: Script::new(RELEASE),
            requeue_stalled: Script::new(REQUEUE_STALLED),
            remove: Script::new(REMOVE),
            clean: Script::new(CLEAN),
        }
    }
}
