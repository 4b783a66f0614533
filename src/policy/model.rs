//! Policy model and normalization.

use crate::config::{PenaltySchema, PolicyConfig};
use crate::context::RequestContext;
use crate::error::{LimiterError, Result};
use crate::resolver::{self, KeyResolver};
use crate::store::PenaltySpec;
use std::sync::Arc;
use std::time::Duration;

/// Per-request exemption predicate
pub type ExemptPredicate = Arc<dyn Fn(&RequestContext<'_>) -> bool + Send + Sync>;

/// Authentication predicate, overriding weaker signals when set
pub type AuthPredicate = Arc<dyn Fn(&RequestContext<'_>) -> bool + Send + Sync>;

/// Dynamic per-request cost function
pub type CostResolver = Arc<dyn Fn(&RequestContext<'_>) -> u64 + Send + Sync>;

/// Penalty escalation parameters of a policy
#[derive(Debug, Clone)]
pub struct PenaltyPolicy {
    /// Whether denials are tracked and escalated at all
    pub enabled: bool,

    /// Sliding window during which denials accumulate
    pub violation_window: Duration,

    /// Escalating block durations; monotonic non-decreasing by convention
    /// but not enforced
    pub penalties: Vec<Duration>,
}

impl Default for PenaltyPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            violation_window: Duration::from_secs(60),
            penalties: Vec::new(),
        }
    }
}

impl PenaltyPolicy {
    fn from_schema(schema: &PenaltySchema) -> Self {
        Self {
            enabled: schema.enabled,
            violation_window: Duration::from_secs(schema.violation_window_secs),
            penalties: schema
                .penalties_secs
                .iter()
                .map(|&secs| Duration::from_secs(secs))
                .collect(),
        }
    }

    /// The spec handed to the store; inert when the policy disables penalties
    pub fn to_spec(&self) -> PenaltySpec {
        if !self.enabled {
            return PenaltySpec::default();
        }
        PenaltySpec {
            violation_window: self.violation_window,
            penalties: self.penalties.clone(),
        }
    }
}

/// A normalized, immutable rate-limit policy.
///
/// Policies are validated once at snapshot build time and never mutated
/// afterwards; reconfiguration replaces the whole snapshot.
#[derive(Clone)]
pub struct Policy {
    /// Policy name (case-insensitive lookup key)
    pub name: String,

    /// Bucket capacity
    pub limit: u64,

    /// Refill window
    pub window: Duration,

    /// Tokens consumed per request
    pub cost: u64,

    /// Capacity override for authenticated callers
    pub authenticated_limit: Option<u64>,

    /// Capacity override for anonymous callers
    pub anonymous_limit: Option<u64>,

    /// Headers signalling authentication for this policy
    pub authenticated_headers: Vec<String>,

    /// Authentication predicate, strongest signal when set
    pub authenticated_when: Option<AuthPredicate>,

    /// Cross-endpoint bucket scope
    pub shared_bucket: Option<String>,

    /// Compiled key resolver
    pub resolver: Arc<dyn KeyResolver>,

    /// Penalty escalation
    pub penalty: PenaltyPolicy,

    /// Policy kill-switch
    pub enabled: bool,

    /// Per-policy exemption predicate
    pub exempt_when: Option<ExemptPredicate>,

    /// Dynamic cost function, consulted when endpoint metadata sets no cost
    pub cost_resolver: Option<CostResolver>,
}

impl std::fmt::Debug for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Policy")
            .field("name", &self.name)
            .field("limit", &self.limit)
            .field("window", &self.window)
            .field("cost", &self.cost)
            .field("authenticated_limit", &self.authenticated_limit)
            .field("anonymous_limit", &self.anonymous_limit)
            .field("shared_bucket", &self.shared_bucket)
            .field("penalty", &self.penalty)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl Policy {
    /// Create a new builder for a policy with the given name
    pub fn builder(name: impl Into<String>) -> PolicyBuilder {
        PolicyBuilder::new(name)
    }

    /// Normalize one configured policy: promote per-period limits, default
    /// the cost, compile resolver specs, validate invariants.
    pub fn from_config(name: &str, config: &PolicyConfig) -> Result<Self> {
        let (limit, window) = materialize_limit(name, config)?;

        let resolver = if !config.key_resolvers.is_empty() {
            compile_for_policy(name, &config.key_resolvers)?
        } else if let Some(strategy) = &config.key_strategy {
            let specs: Vec<String> = strategy
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            compile_for_policy(name, &specs)?
        } else {
            resolver::default_resolver()
        };

        let policy = Self {
            name: name.to_string(),
            limit,
            window,
            cost: config.cost.unwrap_or(1),
            authenticated_limit: config.authenticated_limit,
            anonymous_limit: config.anonymous_limit,
            authenticated_headers: config.authenticated_headers.clone(),
            authenticated_when: None,
            shared_bucket: config.shared_bucket.clone(),
            resolver,
            penalty: PenaltyPolicy::from_schema(&config.penalty),
            enabled: config.enabled,
            exempt_when: None,
            cost_resolver: None,
        };

        policy.validate()?;
        Ok(policy)
    }

    /// Validate the policy invariants, naming the policy and field on failure
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(invalid(&self.name, "Limit must be greater than 0"));
        }
        if self.window.is_zero() {
            return Err(invalid(&self.name, "Window must be greater than 0"));
        }
        if self.cost == 0 {
            return Err(invalid(&self.name, "Cost must be greater than 0"));
        }
        if self.cost > self.limit {
            return Err(invalid(&self.name, "Cost must not exceed Limit"));
        }
        if let Some(limit) = self.authenticated_limit {
            if limit == 0 {
                return Err(invalid(&self.name, "AuthenticatedLimit must be greater than 0"));
            }
        }
        if let Some(limit) = self.anonymous_limit {
            if limit == 0 {
                return Err(invalid(&self.name, "AnonymousLimit must be greater than 0"));
            }
        }
        if self.penalty.penalties.iter().any(Duration::is_zero) {
            return Err(invalid(&self.name, "Penalty durations must be greater than 0"));
        }
        Ok(())
    }
}

fn invalid(policy: &str, message: &str) -> LimiterError {
    LimiterError::Configuration(format!("Policy '{}': {}", policy, message))
}

fn compile_for_policy(name: &str, specs: &[String]) -> Result<Arc<dyn KeyResolver>> {
    resolver::compile_specs(specs)
        .map_err(|e| LimiterError::Configuration(format!("Policy '{}': {}", name, e)))
}

/// Promote per-period convenience fields into `Limit` + `Window`.
fn materialize_limit(name: &str, config: &PolicyConfig) -> Result<(u64, Duration)> {
    if let Some(limit) = config.limit {
        let window_secs = config.window_secs.ok_or_else(|| {
            invalid(name, "Limit requires Window (or use a LimitPer* convenience field)")
        })?;
        if !window_secs.is_finite() || window_secs <= 0.0 {
            return Err(invalid(name, "Window must be greater than 0"));
        }
        return Ok((limit, Duration::from_secs_f64(window_secs)));
    }

    let per_period = [
        (config.limit_per_second, 1u64),
        (config.limit_per_minute, 60),
        (config.limit_per_hour, 3600),
    ];
    for (limit, window_secs) in per_period {
        if let Some(limit) = limit {
            return Ok((limit, Duration::from_secs(window_secs)));
        }
    }

    Err(invalid(
        name,
        "a Limit (with Window) or a LimitPerSecond/Minute/Hour is required",
    ))
}

/// Builder for programmatic policies with fluent API, including the hooks a
/// config file cannot express.
pub struct PolicyBuilder {
    name: String,
    limit: Option<u64>,
    window: Option<Duration>,
    cost: u64,
    authenticated_limit: Option<u64>,
    anonymous_limit: Option<u64>,
    authenticated_headers: Vec<String>,
    authenticated_when: Option<AuthPredicate>,
    shared_bucket: Option<String>,
    resolver: Option<Arc<dyn KeyResolver>>,
    resolver_specs: Vec<String>,
    penalty: PenaltyPolicy,
    enabled: bool,
    exempt_when: Option<ExemptPredicate>,
    cost_resolver: Option<CostResolver>,
}

impl PolicyBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            limit: None,
            window: None,
            cost: 1,
            authenticated_limit: None,
            anonymous_limit: None,
            authenticated_headers: Vec::new(),
            authenticated_when: None,
            shared_bucket: None,
            resolver: None,
            resolver_specs: Vec::new(),
            penalty: PenaltyPolicy::default(),
            enabled: true,
            exempt_when: None,
            cost_resolver: None,
        }
    }

    /// Set the bucket capacity
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the refill window
    pub fn window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }

    /// Set the tokens consumed per request
    pub fn cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }

    /// Set the capacity override for authenticated callers
    pub fn authenticated_limit(mut self, limit: u64) -> Self {
        self.authenticated_limit = Some(limit);
        self
    }

    /// Set the capacity override for anonymous callers
    pub fn anonymous_limit(mut self, limit: u64) -> Self {
        self.anonymous_limit = Some(limit);
        self
    }

    /// Set the headers signalling authentication
    pub fn authenticated_headers(mut self, headers: Vec<String>) -> Self {
        self.authenticated_headers = headers;
        self
    }

    /// Set the authentication predicate
    pub fn authenticated_when(mut self, predicate: AuthPredicate) -> Self {
        self.authenticated_when = Some(predicate);
        self
    }

    /// Share one bucket across every endpoint using this scope name
    pub fn shared_bucket(mut self, name: impl Into<String>) -> Self {
        self.shared_bucket = Some(name.into());
        self
    }

    /// Set an explicit key resolver
    pub fn resolver(mut self, resolver: Arc<dyn KeyResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Set ordered key resolver specs, compiled at build time
    pub fn key_resolvers<I, S>(mut self, specs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resolver_specs = specs.into_iter().map(Into::into).collect();
        self
    }

    /// Set the penalty escalation parameters
    pub fn penalty(mut self, violation_window: Duration, penalties: Vec<Duration>) -> Self {
        self.penalty = PenaltyPolicy {
            enabled: true,
            violation_window,
            penalties,
        };
        self
    }

    /// Disable penalty tracking entirely
    pub fn without_penalties(mut self) -> Self {
        self.penalty.enabled = false;
        self
    }

    /// Set the policy kill-switch
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the per-policy exemption predicate
    pub fn exempt_when(mut self, predicate: ExemptPredicate) -> Self {
        self.exempt_when = Some(predicate);
        self
    }

    /// Set the dynamic cost function
    pub fn cost_resolver(mut self, resolver: CostResolver) -> Self {
        self.cost_resolver = Some(resolver);
        self
    }

    /// Build and validate the policy
    pub fn build(self) -> Result<Policy> {
        let limit = self
            .limit
            .ok_or_else(|| invalid(&self.name, "Limit must be greater than 0"))?;
        let window = self
            .window
            .ok_or_else(|| invalid(&self.name, "Window must be greater than 0"))?;

        let resolver = match self.resolver {
            Some(resolver) => resolver,
            None if !self.resolver_specs.is_empty() => {
                compile_for_policy(&self.name, &self.resolver_specs)?
            }
            None => resolver::default_resolver(),
        };

        let policy = Policy {
            name: self.name,
            limit,
            window,
            cost: self.cost,
            authenticated_limit: self.authenticated_limit,
            anonymous_limit: self.anonymous_limit,
            authenticated_headers: self.authenticated_headers,
            authenticated_when: self.authenticated_when,
            shared_bucket: self.shared_bucket,
            resolver,
            penalty: self.penalty,
            enabled: self.enabled,
            exempt_when: self.exempt_when,
            cost_resolver: self.cost_resolver,
        };

        policy.validate()?;
        Ok(policy)
    }
}
