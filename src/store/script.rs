//! The server-side evaluation script and its reply protocol.
//!
//! The whole decision runs inside Redis so that concurrent requests for the
//! same bucket are serialized and never observe a torn update. The script
//! reads the server clock (`TIME`); client clocks are never part of the
//! refill computation.
//!
//! Reply protocol, a six-element array:
//!
//! `[allowed, blocked, remaining, retry_after, reset_after, violations]`
//!
//! `remaining` crosses the boundary as a string because Redis truncates
//! numeric Lua replies to integers; everything else is integral. A shorter
//! or non-numeric reply is a protocol violation and surfaces as an error,
//! never as a decision.

use crate::error::{LimiterError, Result};
use crate::store::StoreResult;
use once_cell::sync::Lazy;
use redis::Value;
use std::time::Duration;

/// Token bucket + escalating penalty evaluation.
///
/// KEYS: 1 = bucket hash, 2 = block sentinel, 3 = violation counter.
/// ARGV: 1 = capacity, 2 = window seconds, 3 = cost,
///       4 = violation window seconds, 5 = penalty count,
///       6..5+count = penalty durations in seconds.
pub const EVALUATE_SCRIPT: &str = r#"
redis.replicate_commands()

local block_ttl = redis.call('PTTL', KEYS[2])
if block_ttl > 0 then
  return {0, 1, '-1', math.ceil(block_ttl / 1000), 0, 0}
end

local time = redis.call('TIME')
local now = tonumber(time[1]) + tonumber(time[2]) / 1000000

local capacity = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local violation_window = tonumber(ARGV[4])
local penalty_count = tonumber(ARGV[5])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil then tokens = capacity end
if ts == nil then ts = now end

local rate = capacity / window
local elapsed = now - ts
if elapsed < 0 then elapsed = 0 end
local filled = tokens + elapsed * rate
if filled > capacity then filled = capacity end

local allowed = 0
local remaining
if filled >= cost then
  allowed = 1
  remaining = filled - cost
else
  remaining = filled
end

redis.call('HSET', KEYS[1], 'tokens', tostring(remaining), 'ts', tostring(now))
local bucket_ttl = math.ceil(2 * window)
if bucket_ttl < 1 then bucket_ttl = 1 end
redis.call('EXPIRE', KEYS[1], bucket_ttl)

local reset_after = 0
if rate > 0 then
  reset_after = math.ceil((capacity - remaining) / rate)
end

if allowed == 1 then
  return {1, 0, tostring(remaining), 0, reset_after, 0}
end

local violations = 0
if penalty_count > 0 or violation_window > 0 then
  violations = redis.call('INCR', KEYS[3])
  if violation_window > 0 then
    redis.call('EXPIRE', KEYS[3], violation_window)
  end
end

local penalty = 0
if penalty_count > 0 then
  local index = violations
  if index > penalty_count then index = penalty_count end
  penalty = tonumber(ARGV[5 + index])
end

local blocked = 0
if penalty > 0 then
  redis.call('SET', KEYS[2], '1', 'EX', penalty)
  blocked = 1
end

local retry_after
if penalty > 0 then
  retry_after = penalty
elseif rate > 0 then
  retry_after = math.ceil((cost - remaining) / rate)
else
  retry_after = math.ceil(window)
end

return {allowed, blocked, tostring(remaining), retry_after, reset_after, violations}
"#;

/// Compiled script, loaded into the server by SHA on first use and cached
/// for the life of the process.
pub static EVALUATE: Lazy<redis::Script> = Lazy::new(|| redis::Script::new(EVALUATE_SCRIPT));

fn integer_at(items: &[Value], index: usize) -> Result<i64> {
    match &items[index] {
        Value::Int(n) => Ok(*n),
        Value::Data(bytes) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| {
                LimiterError::StoreProtocol(format!(
                    "element {} is not an integer: {:?}",
                    index, items[index]
                ))
            }),
        other => Err(LimiterError::StoreProtocol(format!(
            "element {} is not an integer: {:?}",
            index, other
        ))),
    }
}

fn float_at(items: &[Value], index: usize) -> Result<f64> {
    match &items[index] {
        Value::Int(n) => Ok(*n as f64),
        Value::Data(bytes) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| {
                LimiterError::StoreProtocol(format!(
                    "element {} is not numeric: {:?}",
                    index, items[index]
                ))
            }),
        other => Err(LimiterError::StoreProtocol(format!(
            "element {} is not numeric: {:?}",
            index, other
        ))),
    }
}

/// Parse the script reply into a [`StoreResult`], enforcing the six-element
/// numeric protocol.
pub fn parse_reply(reply: Value) -> Result<StoreResult> {
    let items = match reply {
        Value::Bulk(items) => items,
        other => {
            return Err(LimiterError::StoreProtocol(format!(
                "expected array reply, got {:?}",
                other
            )))
        }
    };

    if items.len() < 6 {
        return Err(LimiterError::StoreProtocol(format!(
            "expected 6 elements, got {}",
            items.len()
        )));
    }

    let allowed = integer_at(&items, 0)? != 0;
    let blocked = integer_at(&items, 1)? != 0;
    let remaining_tokens = float_at(&items, 2)?;
    let retry_after = integer_at(&items, 3)?.max(0) as u64;
    let reset_after = integer_at(&items, 4)?.max(0) as u64;
    let violations = integer_at(&items, 5)?.max(0) as u64;

    Ok(StoreResult {
        allowed,
        blocked,
        remaining_tokens,
        retry_after: Duration::from_secs(retry_after),
        reset_after: Duration::from_secs(reset_after),
        violations,
    })
}
