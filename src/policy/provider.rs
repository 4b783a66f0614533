//! Snapshot-based policy provider.
//!
//! Lookups read the current snapshot without blocking writers; a
//! reconfiguration builds a complete snapshot off to the side and publishes
//! it in one pointer swap. Readers hold their snapshot reference for the
//! duration of one request and never observe a torn mix of old and new
//! policies.

use crate::config::LimiterConfig;
use crate::error::{LimiterError, Result};
use crate::policy::Policy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// One immutable generation of the policy set
#[derive(Debug)]
pub struct PolicySnapshot {
    policies: HashMap<String, Arc<Policy>>,
    default_policy: Option<String>,
}

impl PolicySnapshot {
    fn build(policies: Vec<Policy>, default_policy: Option<String>) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(policies.len());
        for policy in policies {
            let key = policy.name.to_ascii_lowercase();
            let name = policy.name.clone();
            if by_name.insert(key, Arc::new(policy)).is_some() {
                return Err(LimiterError::Configuration(format!(
                    "Policy '{}' is defined more than once (names are case-insensitive)",
                    name
                )));
            }
        }
        Ok(Self {
            policies: by_name,
            default_policy,
        })
    }

    /// Look up a policy by name, case-insensitively
    pub fn get(&self, name: &str) -> Option<Arc<Policy>> {
        self.policies.get(&name.to_ascii_lowercase()).cloned()
    }

    /// Number of policies in this snapshot
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Whether this snapshot holds no policies
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

/// Policy provider with atomic snapshot replacement
#[derive(Debug)]
pub struct PolicyProvider {
    snapshot: RwLock<Arc<PolicySnapshot>>,
}

impl PolicyProvider {
    /// Create a provider from programmatic policies
    pub fn new(policies: Vec<Policy>, default_policy: Option<String>) -> Result<Self> {
        let snapshot = PolicySnapshot::build(policies, default_policy)?;
        Ok(Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Create a provider from configuration, normalizing every policy
    pub fn from_config(config: &LimiterConfig) -> Result<Self> {
        let snapshot = Self::snapshot_from_config(config)?;
        Ok(Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
        })
    }

    fn snapshot_from_config(config: &LimiterConfig) -> Result<PolicySnapshot> {
        let mut policies = Vec::with_capacity(config.policies.len());
        for (name, policy_config) in &config.policies {
            policies.push(Policy::from_config(name, policy_config)?);
        }

        if let Some(default) = &config.default_policy {
            let key = default.to_ascii_lowercase();
            if !config
                .policies
                .keys()
                .any(|name| name.to_ascii_lowercase() == key)
            {
                return Err(LimiterError::Configuration(format!(
                    "Default policy '{}' is not defined",
                    default
                )));
            }
        }

        PolicySnapshot::build(policies, config.default_policy.clone())
    }

    /// Rebuild the snapshot from new configuration and publish it atomically.
    /// On error the current snapshot stays in place.
    pub fn reload(&self, config: &LimiterConfig) -> Result<()> {
        let snapshot = Arc::new(Self::snapshot_from_config(config)?);
        let count = snapshot.len();
        *self.snapshot.write() = snapshot;
        tracing::info!(policies = count, "Published new policy snapshot");
        Ok(())
    }

    /// Replace the snapshot with programmatic policies
    pub fn publish(&self, policies: Vec<Policy>, default_policy: Option<String>) -> Result<()> {
        let snapshot = Arc::new(PolicySnapshot::build(policies, default_policy)?);
        *self.snapshot.write() = snapshot;
        Ok(())
    }

    /// The current snapshot; callers hold it for at most one request
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.snapshot.read().clone()
    }

    /// Look up a policy by name, case-insensitively. `None` is not an
    /// error: the driver treats it as "no limiting applies".
    pub fn get_policy(&self, name: &str) -> Option<Arc<Policy>> {
        self.snapshot().get(name)
    }

    /// The configured default policy, if any
    pub fn get_default(&self) -> Option<Arc<Policy>> {
        let snapshot = self.snapshot();
        snapshot
            .default_policy
            .as_deref()
            .and_then(|name| snapshot.get(name))
    }
}
