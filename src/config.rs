//! Configuration: the serde schema consumed from files/environment and the
//! runtime options carrying the hooks that cannot live in a config file.

use crate::driver::Decision;
use crate::metrics::{MetricsSink, NoopSink};
use crate::policy::{AuthPredicate, ExemptPredicate};
use crate::resolver::{self, KeyResolver};
use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Custom rejection body writer, exclusive with the configured body
pub type RejectionHandler = Arc<dyn Fn(&Request<Body>, &Decision) -> Response + Send + Sync>;

/// Top-level limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Store key prefix
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Attach `X-RateLimit-*` headers to responses
    #[serde(default = "default_true")]
    pub emit_headers: bool,

    /// On store failure, let the request through instead of failing the call
    #[serde(default = "default_true")]
    pub fail_open: bool,

    /// Policy applied when endpoint metadata names none
    #[serde(default)]
    pub default_policy: Option<String>,

    /// Headers whose presence (with a non-empty value) marks a caller as
    /// authenticated, absent stronger signals
    #[serde(default)]
    pub authenticated_headers: Vec<String>,

    /// Rejection response configuration
    #[serde(default)]
    pub rejection: RejectionConfig,

    /// Store backend configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Named policies
    #[serde(default)]
    pub policies: HashMap<String, PolicyConfig>,
}

impl LimiterConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("ELF_ARL_CONFIG").unwrap_or_else(|_| "config/default.toml".to_string());

        config::Config::builder()
            // Start with default values
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            // Override with config file if it exists
            .add_source(config::File::with_name(&config_path).required(false))
            // Override with environment variables (prefix: ELF_ARL__)
            .add_source(
                config::Environment::with_prefix("ELF_ARL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            emit_headers: true,
            fail_open: true,
            default_policy: None,
            authenticated_headers: Vec::new(),
            rejection: RejectionConfig::default(),
            store: StoreConfig::default(),
            policies: HashMap::new(),
        }
    }
}

/// Rejection response body configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectionConfig {
    /// Response body written on denial
    #[serde(default = "default_rejection_body")]
    pub body: String,

    /// Content type of the rejection body
    #[serde(default = "default_rejection_content_type")]
    pub content_type: String,
}

impl Default for RejectionConfig {
    fn default() -> Self {
        Self {
            body: default_rejection_body(),
            content_type: default_rejection_content_type(),
        }
    }
}

/// Store backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend selection
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Store call deadline in milliseconds; expiry is a store error
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: None,
            timeout_ms: default_store_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Redis,
    /// Single-process backend for tests and development
    Memory,
}

/// One named policy as configured
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Bucket capacity
    #[serde(default)]
    pub limit: Option<u64>,

    /// Refill window in seconds
    #[serde(default)]
    pub window_secs: Option<f64>,

    /// Convenience forms, materialized into `limit` + `window_secs`
    #[serde(default)]
    pub limit_per_second: Option<u64>,
    #[serde(default)]
    pub limit_per_minute: Option<u64>,
    #[serde(default)]
    pub limit_per_hour: Option<u64>,

    /// Tokens consumed per request
    #[serde(default)]
    pub cost: Option<u64>,

    /// Identity-conditional capacity overrides
    #[serde(default)]
    pub authenticated_limit: Option<u64>,
    #[serde(default)]
    pub anonymous_limit: Option<u64>,

    /// Headers signalling authentication for this policy
    #[serde(default)]
    pub authenticated_headers: Vec<String>,

    /// Cross-endpoint bucket scope
    #[serde(default)]
    pub shared_bucket: Option<String>,

    /// Ordered key resolver specs
    #[serde(default)]
    pub key_resolvers: Vec<String>,

    /// Comma-separated resolver spec shorthand
    #[serde(default)]
    pub key_strategy: Option<String>,

    /// Penalty escalation
    #[serde(default)]
    pub penalty: PenaltySchema,

    /// Policy kill-switch
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            limit: None,
            window_secs: None,
            limit_per_second: None,
            limit_per_minute: None,
            limit_per_hour: None,
            cost: None,
            authenticated_limit: None,
            anonymous_limit: None,
            authenticated_headers: Vec::new(),
            shared_bucket: None,
            key_resolvers: Vec::new(),
            key_strategy: None,
            penalty: PenaltySchema::default(),
            enabled: true,
        }
    }
}

/// Penalty escalation as configured
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PenaltySchema {
    /// Whether denials are tracked and escalated at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sliding window (seconds) during which denials accumulate
    #[serde(default = "default_violation_window_secs")]
    pub violation_window_secs: u64,

    /// Escalating block durations in seconds
    #[serde(default)]
    pub penalties_secs: Vec<u64>,
}

impl Default for PenaltySchema {
    fn default() -> Self {
        Self {
            enabled: true,
            violation_window_secs: default_violation_window_secs(),
            penalties_secs: Vec::new(),
        }
    }
}

fn default_prefix() -> String {
    "elf:accessrl".to_string()
}

fn default_true() -> bool {
    true
}

fn default_rejection_body() -> String {
    r#"{"error":"rate_limited","message":"Too many requests"}"#.to_string()
}

fn default_rejection_content_type() -> String {
    "application/json".to_string()
}

fn default_store_timeout_ms() -> u64 {
    1000
}

fn default_violation_window_secs() -> u64 {
    60
}

/// Runtime options: the configured scalars plus the hooks a config file
/// cannot express.
#[derive(Clone)]
pub struct RateLimiterOptions {
    pub prefix: String,
    pub emit_headers: bool,
    pub fail_open: bool,
    pub default_policy: Option<String>,
    pub rejection_body: String,
    pub rejection_content_type: String,
    pub authenticated_headers: Vec<String>,
    /// Global authentication predicate, consulted after any per-policy one
    pub authenticated_when: Option<AuthPredicate>,
    /// Global exemption predicate
    pub exempt_when: Option<ExemptPredicate>,
    /// Resolver retried once when the policy resolver yields no identity
    pub fallback_resolver: Arc<dyn KeyResolver>,
    /// Custom rejection writer, exclusive with the configured body
    pub on_rejected: Option<RejectionHandler>,
    /// Decision metrics sink
    pub metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for RateLimiterOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterOptions")
            .field("prefix", &self.prefix)
            .field("emit_headers", &self.emit_headers)
            .field("fail_open", &self.fail_open)
            .field("default_policy", &self.default_policy)
            .field("authenticated_headers", &self.authenticated_headers)
            .field("authenticated_when", &self.authenticated_when.is_some())
            .field("exempt_when", &self.exempt_when.is_some())
            .field("on_rejected", &self.on_rejected.is_some())
            .finish()
    }
}

impl RateLimiterOptions {
    /// Create a new builder for RateLimiterOptions
    pub fn builder() -> RateLimiterOptionsBuilder {
        RateLimiterOptionsBuilder::default()
    }

    /// Build runtime options from a loaded configuration
    pub fn from_config(config: &LimiterConfig) -> Self {
        Self {
            prefix: config.prefix.clone(),
            emit_headers: config.emit_headers,
            fail_open: config.fail_open,
            default_policy: config.default_policy.clone(),
            rejection_body: config.rejection.body.clone(),
            rejection_content_type: config.rejection.content_type.clone(),
            authenticated_headers: config.authenticated_headers.clone(),
            authenticated_when: None,
            exempt_when: None,
            fallback_resolver: resolver::default_resolver(),
            on_rejected: None,
            metrics: Arc::new(NoopSink),
        }
    }
}

impl Default for RateLimiterOptions {
    fn default() -> Self {
        Self::from_config(&LimiterConfig::default())
    }
}

/// Builder for RateLimiterOptions with fluent API
#[derive(Default)]
pub struct RateLimiterOptionsBuilder {
    config: Option<LimiterConfig>,
    prefix: Option<String>,
    emit_headers: Option<bool>,
    fail_open: Option<bool>,
    default_policy: Option<String>,
    rejection_body: Option<String>,
    rejection_content_type: Option<String>,
    authenticated_headers: Option<Vec<String>>,
    authenticated_when: Option<AuthPredicate>,
    exempt_when: Option<ExemptPredicate>,
    fallback_resolver: Option<Arc<dyn KeyResolver>>,
    on_rejected: Option<RejectionHandler>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl RateLimiterOptionsBuilder {
    /// Seed the builder from a loaded configuration
    pub fn config(mut self, config: LimiterConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the store key prefix
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Enable or disable `X-RateLimit-*` response headers
    pub fn emit_headers(mut self, emit: bool) -> Self {
        self.emit_headers = Some(emit);
        self
    }

    /// Set the store failure policy
    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = Some(fail_open);
        self
    }

    /// Set the policy applied when endpoint metadata names none
    pub fn default_policy(mut self, name: impl Into<String>) -> Self {
        self.default_policy = Some(name.into());
        self
    }

    /// Set the rejection body and content type
    pub fn rejection_body(
        mut self,
        body: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        self.rejection_body = Some(body.into());
        self.rejection_content_type = Some(content_type.into());
        self
    }

    /// Set the headers that mark a caller as authenticated
    pub fn authenticated_headers(mut self, headers: Vec<String>) -> Self {
        self.authenticated_headers = Some(headers);
        self
    }

    /// Set the global authentication predicate
    pub fn authenticated_when(mut self, predicate: AuthPredicate) -> Self {
        self.authenticated_when = Some(predicate);
        self
    }

    /// Set the global exemption predicate
    pub fn exempt_when(mut self, predicate: ExemptPredicate) -> Self {
        self.exempt_when = Some(predicate);
        self
    }

    /// Set the fallback resolver retried when the policy resolver yields
    /// no identity
    pub fn fallback_resolver(mut self, resolver: Arc<dyn KeyResolver>) -> Self {
        self.fallback_resolver = Some(resolver);
        self
    }

    /// Set the custom rejection writer
    pub fn on_rejected(mut self, handler: RejectionHandler) -> Self {
        self.on_rejected = Some(handler);
        self
    }

    /// Set the decision metrics sink
    pub fn metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    /// Build the options
    pub fn build(self) -> RateLimiterOptions {
        let base = self
            .config
            .as_ref()
            .map(RateLimiterOptions::from_config)
            .unwrap_or_default();

        RateLimiterOptions {
            prefix: self.prefix.unwrap_or(base.prefix),
            emit_headers: self.emit_headers.unwrap_or(base.emit_headers),
            fail_open: self.fail_open.unwrap_or(base.fail_open),
            default_policy: self.default_policy.or(base.default_policy),
            rejection_body: self.rejection_body.unwrap_or(base.rejection_body),
            rejection_content_type: self
                .rejection_content_type
                .unwrap_or(base.rejection_content_type),
            authenticated_headers: self
                .authenticated_headers
                .unwrap_or(base.authenticated_headers),
            authenticated_when: self.authenticated_when,
            exempt_when: self.exempt_when,
            fallback_resolver: self.fallback_resolver.unwrap_or(base.fallback_resolver),
            on_rejected: self.on_rejected,
            metrics: self.metrics.unwrap_or(base.metrics),
        }
    }
}
