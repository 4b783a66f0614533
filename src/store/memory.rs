//! In-memory rate-limit store for tests and single-process development.
//!
//! Mirrors the Redis evaluation script operation-for-operation, including
//! lazy key expiry and the block-gate early exit. State lives in one mutex,
//! so evaluations are serialized exactly like the server-side script. Not a
//! substitute for the Redis backend in a fleet: nothing is shared across
//! processes.

use crate::error::Result;
use crate::store::{RateLimitStore, StoreRequest, StoreResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Clock returning float seconds, injectable for deterministic tests
pub type ClockFn = Arc<dyn Fn() -> f64 + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    ts: f64,
    expires_at: f64,
}

#[derive(Debug, Clone, Copy)]
struct Violation {
    count: u64,
    expires_at: f64,
}

#[derive(Default)]
struct MemoryState {
    buckets: HashMap<String, Bucket>,
    blocks: HashMap<String, f64>,
    violations: HashMap<String, Violation>,
}

/// In-memory store with the same observable semantics as [`RedisStore`].
///
/// [`RedisStore`]: crate::store::RedisStore
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    clock: ClockFn,
}

impl InMemoryStore {
    /// Create a store using the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0)
        }))
    }

    /// Create a store with a custom clock (float seconds)
    pub fn with_clock(clock: ClockFn) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            clock,
        }
    }

    /// Drop all bucket, block, and violation state
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.buckets.clear();
        state.blocks.clear();
        state.violations.clear();
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryStore {
    async fn evaluate(&self, request: &StoreRequest) -> Result<StoreResult> {
        let now = (self.clock)();
        let mut state = self.state.lock();

        // Penalty gate: an active block denies before any bucket work.
        if let Some(&block_expires) = state.blocks.get(&request.block_key) {
            if block_expires > now {
                return Ok(StoreResult {
                    allowed: false,
                    blocked: true,
                    remaining_tokens: -1.0,
                    retry_after: Duration::from_secs((block_expires - now).ceil() as u64),
                    reset_after: Duration::ZERO,
                    violations: 0,
                });
            }
            state.blocks.remove(&request.block_key);
        }

        let capacity = request.capacity as f64;
        let window = request.window.as_secs_f64();
        let cost = request.cost as f64;

        let (tokens, ts) = match state.buckets.get(&request.bucket_key) {
            Some(bucket) if bucket.expires_at > now => (bucket.tokens, bucket.ts),
            _ => (capacity, now),
        };

        let rate = capacity / window;
        let elapsed = (now - ts).max(0.0);
        let filled = (tokens + elapsed * rate).min(capacity);

        let allowed = filled >= cost;
        let remaining = if allowed { filled - cost } else { filled };

        let bucket_ttl = (2.0 * window).ceil().max(1.0);
        state.buckets.insert(
            request.bucket_key.clone(),
            Bucket {
                tokens: remaining,
                ts: now,
                expires_at: now + bucket_ttl,
            },
        );

        let reset_after = if rate > 0.0 {
            Duration::from_secs(((capacity - remaining) / rate).ceil() as u64)
        } else {
            Duration::ZERO
        };

        if allowed {
            return Ok(StoreResult {
                allowed: true,
                blocked: false,
                remaining_tokens: remaining,
                retry_after: Duration::ZERO,
                reset_after,
                violations: 0,
            });
        }

        let violation_window = request.penalty.violation_window.as_secs_f64();
        let penalty_count = request.penalty.penalties.len();

        let mut violations = 0u64;
        if penalty_count > 0 || violation_window > 0.0 {
            let entry = match state.violations.get(&request.violation_key) {
                Some(v) if v.expires_at > now => v.count + 1,
                _ => 1,
            };
            let expires_at = if violation_window > 0.0 {
                now + violation_window
            } else {
                f64::INFINITY
            };
            state.violations.insert(
                request.violation_key.clone(),
                Violation {
                    count: entry,
                    expires_at,
                },
            );
            violations = entry;
        }

        let penalty = if penalty_count > 0 {
            let index = (violations as usize).min(penalty_count);
            request.penalty.penalties[index - 1]
        } else {
            Duration::ZERO
        };

        let blocked = !penalty.is_zero();
        if blocked {
            state
                .blocks
                .insert(request.block_key.clone(), now + penalty.as_secs_f64());
        }

        let retry_after = if blocked {
            penalty
        } else if rate > 0.0 {
            Duration::from_secs(((cost - remaining) / rate).ceil() as u64)
        } else {
            Duration::from_secs(window.ceil() as u64)
        };

        Ok(StoreResult {
            allowed: false,
            blocked,
            remaining_tokens: remaining,
            retry_after,
            reset_after,
            violations,
        })
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
