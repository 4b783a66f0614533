//! Decision driver: per-request orchestration of policy lookup, scope and
//! key resolution, effective limit/cost computation, and the store call.
//!
//! The driver is the single error boundary of the decision path. Nothing
//! below it recovers errors; everything above it (the middleware) only
//! shapes the outcomes it returns.

mod keys;

pub use keys::{key_fingerprint, sanitize_scope, store_keys, StoreKeys};

use crate::config::RateLimiterOptions;
use crate::context::{RateLimitMeta, RequestContext};
use crate::error::Result;
use crate::policy::{Policy, PolicyProvider};
use crate::store::{RateLimitStore, StoreRequest};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// The immutable product of one evaluation
#[derive(Debug, Clone)]
pub struct Decision {
    /// Policy that produced this decision
    pub policy: String,

    /// Sanitized bucket scope
    pub scope: String,

    /// Hex SHA-256 fingerprint of the caller key
    pub key_hash: String,

    /// Effective limit applied to this caller
    pub limit: u64,

    /// Remaining tokens, floored to an integer >= 0
    pub remaining: u64,

    /// Cost charged (or attempted) by this request
    pub cost: u64,

    /// How long until a retry can succeed; zero when allowed
    pub retry_after: Duration,

    /// When the bucket is full again (display hint, local UTC)
    pub reset: DateTime<Utc>,

    /// Whether the request may proceed
    pub allowed: bool,

    /// Whether an escalating penalty is in force
    pub blocked: bool,

    /// Violations accumulated within the violation window
    pub violations: u64,
}

/// Why a request bypassed limiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    /// Neither endpoint metadata nor the global default named a policy
    NoPolicy,
    /// The named policy is not in the current snapshot
    UnknownPolicy,
    /// The policy kill-switch is off
    Disabled,
    /// A global or per-policy exemption predicate matched
    Exempt,
    /// No resolver produced a stable caller identity
    NoIdentity,
    /// The store failed and the policy is fail-open
    StoreFailure,
}

/// Result of driving one request through the decision pipeline
#[derive(Debug, Clone)]
pub enum Outcome {
    /// No limiting applies; forward untouched
    Bypass(BypassReason),
    /// Within limits; forward with rate-limit metadata
    Allowed(Decision),
    /// Limited or blocked; reject with 429
    Denied(Decision),
}

/// Per-request decision pipeline
pub struct DecisionDriver {
    provider: Arc<PolicyProvider>,
    store: Arc<dyn RateLimitStore>,
    options: Arc<RateLimiterOptions>,
}

impl DecisionDriver {
    pub fn new(
        provider: Arc<PolicyProvider>,
        store: Arc<dyn RateLimitStore>,
        options: Arc<RateLimiterOptions>,
    ) -> Self {
        Self {
            provider,
            store,
            options,
        }
    }

    pub fn options(&self) -> &Arc<RateLimiterOptions> {
        &self.options
    }

    pub fn provider(&self) -> &Arc<PolicyProvider> {
        &self.provider
    }

    /// Evaluate one request. `Err` is only returned for store failures under
    /// fail-closed policy (and surfaces as an infrastructure failure, never
    /// as a limit).
    pub async fn evaluate(
        &self,
        ctx: &RequestContext<'_>,
        meta: &RateLimitMeta,
    ) -> Result<Outcome> {
        let policy_name = meta
            .policy
            .as_deref()
            .or(self.options.default_policy.as_deref());
        let Some(policy_name) = policy_name else {
            return Ok(Outcome::Bypass(BypassReason::NoPolicy));
        };

        let Some(policy) = self.provider.get_policy(policy_name) else {
            warn!(policy = %policy_name, path = %ctx.path, "Unknown rate-limit policy; bypassing");
            return Ok(Outcome::Bypass(BypassReason::UnknownPolicy));
        };

        if !policy.enabled {
            debug!(policy = %policy.name, "Policy disabled; bypassing");
            return Ok(Outcome::Bypass(BypassReason::Disabled));
        }

        let globally_exempt = self
            .options
            .exempt_when
            .as_ref()
            .is_some_and(|exempt| exempt(ctx));
        let policy_exempt = policy.exempt_when.as_ref().is_some_and(|exempt| exempt(ctx));
        if globally_exempt || policy_exempt {
            debug!(policy = %policy.name, "Request exempt; bypassing");
            return Ok(Outcome::Bypass(BypassReason::Exempt));
        }

        let scope = meta
            .scope
            .as_deref()
            .or(policy.shared_bucket.as_deref())
            .or(ctx.route)
            .or(ctx.endpoint_name)
            .unwrap_or("unknown");

        let Some(key) = self.resolve_key(&policy, ctx).await else {
            debug!(policy = %policy.name, "No caller identity; bypassing");
            return Ok(Outcome::Bypass(BypassReason::NoIdentity));
        };

        let limit = self.effective_limit(&policy, ctx);
        let cost = self.effective_cost(&policy, ctx, meta, limit);

        let key_hash = keys::key_fingerprint(&key);
        let scope_key = keys::sanitize_scope(scope);
        let store_keys = keys::store_keys(&self.options.prefix, &policy.name, &scope_key, &key_hash);

        let request = StoreRequest {
            bucket_key: store_keys.bucket,
            block_key: store_keys.block,
            violation_key: store_keys.violation,
            capacity: limit,
            window: policy.window,
            cost,
            penalty: policy.penalty.to_spec(),
        };

        let result = match self.store.evaluate(&request).await {
            Ok(result) => result,
            Err(e) if self.options.fail_open => {
                error!(policy = %policy.name, error = %e, "Store failure; failing open");
                return Ok(Outcome::Bypass(BypassReason::StoreFailure));
            }
            Err(e) => {
                error!(policy = %policy.name, error = %e, "Store failure; failing closed");
                return Err(e);
            }
        };

        // The block-gate early exit reports -1 remaining; display floors to 0.
        let remaining = result.remaining_tokens.max(0.0).floor() as u64;
        let reset_after = if result.reset_after > Duration::ZERO {
            result.reset_after
        } else {
            result.retry_after
        };
        let reset = Utc::now()
            + chrono::Duration::from_std(reset_after).unwrap_or_else(|_| chrono::Duration::zero());

        let decision = Decision {
            policy: policy.name.clone(),
            scope: scope_key,
            key_hash,
            limit,
            remaining,
            cost,
            retry_after: result.retry_after,
            reset,
            allowed: result.allowed,
            blocked: result.blocked,
            violations: result.violations,
        };

        if decision.allowed {
            Ok(Outcome::Allowed(decision))
        } else {
            Ok(Outcome::Denied(decision))
        }
    }

    /// Resolve the caller key, retrying the fallback resolver exactly once.
    /// Resolver failures widen to "no identity": a caller that cannot be
    /// identified cannot be penalized.
    async fn resolve_key(&self, policy: &Policy, ctx: &RequestContext<'_>) -> Option<String> {
        match policy.resolver.resolve(ctx).await {
            Ok(Some(key)) if !key.is_empty() => return Some(key),
            Ok(_) => {}
            Err(e) => {
                warn!(policy = %policy.name, error = %e, "Key resolver failed; trying fallback")
            }
        }

        match self.options.fallback_resolver.resolve(ctx).await {
            Ok(Some(key)) if !key.is_empty() => Some(key),
            Ok(_) => None,
            Err(e) => {
                warn!(policy = %policy.name, error = %e, "Fallback resolver failed");
                None
            }
        }
    }

    /// Signal precedence: policy predicate, then global predicate, then the
    /// principal, then the configured authentication headers.
    fn is_authenticated(&self, policy: &Policy, ctx: &RequestContext<'_>) -> bool {
        if let Some(predicate) = &policy.authenticated_when {
            return predicate(ctx);
        }
        if let Some(predicate) = &self.options.authenticated_when {
            return predicate(ctx);
        }
        if let Some(auth) = ctx.auth {
            return auth.is_authenticated;
        }

        let headers = if !policy.authenticated_headers.is_empty() {
            &policy.authenticated_headers
        } else {
            &self.options.authenticated_headers
        };
        ctx.any_header_present(headers)
    }

    fn effective_limit(&self, policy: &Policy, ctx: &RequestContext<'_>) -> u64 {
        if self.is_authenticated(policy, ctx) {
            policy.authenticated_limit.unwrap_or(policy.limit)
        } else {
            policy.anonymous_limit.unwrap_or(policy.limit)
        }
    }

    fn effective_cost(
        &self,
        policy: &Policy,
        ctx: &RequestContext<'_>,
        meta: &RateLimitMeta,
        limit: u64,
    ) -> u64 {
        let cost = meta
            .cost
            .filter(|&cost| cost > 0)
            .or_else(|| {
                policy
                    .cost_resolver
                    .as_ref()
                    .map(|resolver| resolver(ctx))
            })
            .unwrap_or(policy.cost);

        cost.clamp(1, limit)
    }
}
