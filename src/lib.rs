//! Distributed access rate limiting for axum/tower services.
//!
//! This crate fronts expensive HTTP endpoints (downloads, exports, reports)
//! across a horizontally scaled fleet with:
//! - Atomic token-bucket evaluation in a shared Redis store
//! - Escalating time-bounded penalties for repeat offenders
//! - Policy-driven caller identity (IP, claims, headers, composites)
//! - Fail-open or fail-closed handling of store failures
//! - Standard `X-RateLimit-*` / `Retry-After` response surface
//!
//! Decisions are consistent across all instances because the store is the
//! sole authority: every evaluation runs as one server-side script, and
//! nothing is cached in-process.
//!
//! # Example
//!
//! ```no_run
//! use elf_access_limiter::{LimiterConfig, RateLimiter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = LimiterConfig::load()?;
//!     let limiter = RateLimiter::from_config(&config).await?;
//!
//!     let app: axum::Router = axum::Router::new()
//!         .route("/exports", axum::routing::get(|| async { "export" }))
//!         .layer(limiter.layer_for("exports"));
//!
//!     # let _ = app;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod policy;
pub mod resolver;
pub mod store;

pub use crate::config::{LimiterConfig, RateLimiterOptions, RateLimiterOptionsBuilder};
pub use crate::context::{AuthContext, RateLimitMeta, RequestContext};
pub use crate::driver::{BypassReason, Decision, DecisionDriver, Outcome};
pub use crate::error::{LimiterError, Result};
pub use crate::metrics::{MetricsSink, NoopSink, PrometheusSink};
pub use crate::middleware::{RateLimitLayer, RateLimitService};
pub use crate::policy::{Policy, PolicyBuilder, PolicyProvider};
pub use crate::resolver::KeyResolver;
pub use crate::store::{create_store, InMemoryStore, RateLimitStore, RedisStore};

use std::sync::Arc;

/// Assembled rate limiter: provider, store, and driver behind one handle.
#[derive(Clone)]
pub struct RateLimiter {
    driver: Arc<DecisionDriver>,
}

impl RateLimiter {
    /// Build a limiter from configuration: normalize policies, connect the
    /// store, and wire the driver with default runtime options.
    pub async fn from_config(config: &LimiterConfig) -> Result<Self> {
        let options = RateLimiterOptions::from_config(config);
        Self::with_options(config, options).await
    }

    /// Build a limiter from configuration with explicit runtime options
    /// (hooks, custom fallback resolver, metrics sink).
    pub async fn with_options(config: &LimiterConfig, options: RateLimiterOptions) -> Result<Self> {
        let provider = Arc::new(PolicyProvider::from_config(config)?);
        let store = store::create_store(&config.store).await?;
        let driver = Arc::new(DecisionDriver::new(provider, store, Arc::new(options)));
        Ok(Self { driver })
    }

    /// Build a limiter from pre-assembled parts
    pub fn new(
        provider: Arc<PolicyProvider>,
        store: Arc<dyn RateLimitStore>,
        options: RateLimiterOptions,
    ) -> Self {
        Self {
            driver: Arc::new(DecisionDriver::new(provider, store, Arc::new(options))),
        }
    }

    /// The decision driver, for non-middleware callers
    pub fn driver(&self) -> Arc<DecisionDriver> {
        self.driver.clone()
    }

    /// Middleware layer with no layer-level policy; selection comes from
    /// request extensions or the configured default policy
    pub fn layer(&self) -> RateLimitLayer {
        RateLimitLayer::new(self.driver.clone())
    }

    /// Middleware layer pinning the given policy
    pub fn layer_for(&self, policy: impl Into<String>) -> RateLimitLayer {
        RateLimitLayer::with_policy(self.driver.clone(), policy)
    }

    /// Replace the policy snapshot from new configuration; in-flight
    /// requests finish against the snapshot they started with
    pub fn reload(&self, config: &LimiterConfig) -> Result<()> {
        self.driver.provider().reload(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StoreBackend, StoreConfig};
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_limiter_from_config_with_memory_store() {
        let mut policies = HashMap::new();
        policies.insert(
            "api".to_string(),
            crate::config::PolicyConfig {
                limit: Some(10),
                window_secs: Some(60.0),
                ..Default::default()
            },
        );

        let config = LimiterConfig {
            store: StoreConfig {
                backend: StoreBackend::Memory,
                redis_url: None,
                timeout_ms: 1000,
            },
            policies,
            ..Default::default()
        };

        let limiter = RateLimiter::from_config(&config).await.unwrap();
        assert!(limiter.driver().provider().get_policy("API").is_some());

        let _layer = limiter.layer_for("api");
        let _layer = limiter.layer();
    }
}
