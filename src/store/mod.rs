//! Shared key-value store backends for atomic rate decisions.
//!
//! The store is the sole authority for bucket, block, and violation state.
//! Every evaluation executes as a single atomic action; concurrent requests
//! for the same bucket are serialized by the store, and no two evaluations
//! observe the same bucket snapshot. Decisions are never cached in-process.

pub mod memory;
pub mod redis;
mod script;

pub use self::memory::InMemoryStore;
pub use self::redis::RedisStore;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::{LimiterError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Penalty escalation parameters for one evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PenaltySpec {
    /// Sliding window during which repeated denials accumulate. Zero means
    /// violations are not tracked over time (the counter never expires).
    pub violation_window: Duration,

    /// Escalating block durations; the k-th violation selects entry
    /// `min(k, len)` (1-indexed). Empty means no blocking.
    pub penalties: Vec<Duration>,
}

impl PenaltySpec {
    /// Whether this spec requires any violation bookkeeping at all
    pub fn is_active(&self) -> bool {
        !self.penalties.is_empty() || !self.violation_window.is_zero()
    }
}

/// One atomic evaluation request. Keys are pre-assembled and pre-sanitized
/// by the decision driver.
#[derive(Debug, Clone)]
pub struct StoreRequest {
    /// Token bucket hash key (`<prefix>:bucket:<policy>:<scope>:<keyHash>`)
    pub bucket_key: String,

    /// Penalty block sentinel key (`<prefix>:block:...`)
    pub block_key: String,

    /// Violation counter key (`<prefix>:viol:...`)
    pub violation_key: String,

    /// Bucket capacity (effective limit), always >= 1
    pub capacity: u64,

    /// Refill window; a full bucket refills over this duration
    pub window: Duration,

    /// Tokens consumed by this request, clamped to `[1, capacity]` upstream
    pub cost: u64,

    /// Penalty escalation parameters
    pub penalty: PenaltySpec,
}

/// Result of one atomic evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreResult {
    /// Whether the request may proceed
    pub allowed: bool,

    /// Whether an escalating penalty is in force
    pub blocked: bool,

    /// Tokens left in the bucket after this evaluation. `-1.0` on the
    /// block-gate early exit, which skips bucket state entirely.
    pub remaining_tokens: f64,

    /// Seconds until a retry can succeed; zero when allowed
    pub retry_after: Duration,

    /// Seconds until the bucket is full again
    pub reset_after: Duration,

    /// Violation count observed by this evaluation; zero when allowed
    pub violations: u64,
}

/// Atomic rate-decision store.
///
/// Implementations must evaluate the token bucket, penalty gate, and
/// violation escalation in one indivisible step per request.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Atomically evaluate one request against shared bucket state
    async fn evaluate(&self, request: &StoreRequest) -> Result<StoreResult>;

    /// Probe store liveness, for readiness checks
    async fn ping(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn RateLimitStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn RateLimitStore")
    }
}

/// Create a rate-limit store based on configuration
pub async fn create_store(config: &StoreConfig) -> Result<Arc<dyn RateLimitStore>> {
    match config.backend {
        StoreBackend::Redis => {
            let redis_url = config.redis_url.as_ref().ok_or_else(|| {
                LimiterError::Configuration(
                    "Redis backend requires 'redis_url' configuration".to_string(),
                )
            })?;

            tracing::info!(url = %redis_url, "Initializing Redis rate-limit store");

            let store = RedisStore::connect(redis_url, Duration::from_millis(config.timeout_ms))
                .await?;
            Ok(Arc::new(store))
        }

        StoreBackend::Memory => {
            tracing::warn!(
                "In-memory rate-limit store selected; decisions are not shared across instances"
            );
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}
