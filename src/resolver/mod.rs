//! Key resolver pipeline: HTTP request -> stable caller identity.
//!
//! A resolver maps a request to a nullable string; `None` means the request
//! carries no stable identity and skips limiting. Resolver specs are parsed
//! once during policy normalization, never per request.

mod builtin;
mod composite;

pub use builtin::{
    ClaimResolver, ClientIdResolver, HeaderResolver, IpResolver, SubResolver, UserResolver,
};
pub use composite::CompositeResolver;

use crate::context::RequestContext;
use crate::error::{LimiterError, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Maps a request to a stable caller identity.
///
/// Built-ins never perform I/O; custom implementations may. Cancellation is
/// by dropping the returned future, so implementations must not hold state
/// that outlives an abandoned resolve.
#[async_trait]
pub trait KeyResolver: Send + Sync {
    /// Resolve the caller key, or `None` when no stable identity exists
    async fn resolve(&self, ctx: &RequestContext<'_>) -> Result<Option<String>>;
}

impl std::fmt::Debug for dyn KeyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn KeyResolver")
    }
}

/// Parse one resolver spec (case-insensitive)
fn parse_spec(spec: &str) -> Result<Arc<dyn KeyResolver>> {
    let trimmed = spec.trim();
    let lower = trimmed.to_ascii_lowercase();

    if let Some(claim_type) = lower.strip_prefix("claim:") {
        if claim_type.is_empty() {
            return Err(LimiterError::Configuration(format!(
                "Key resolver spec '{}' is missing a claim type",
                trimmed
            )));
        }
        // Preserve the original casing of the claim type itself.
        return Ok(Arc::new(ClaimResolver::new(&trimmed[6..])));
    }

    if let Some(header_name) = lower.strip_prefix("header:") {
        if header_name.is_empty() {
            return Err(LimiterError::Configuration(format!(
                "Key resolver spec '{}' is missing a header name",
                trimmed
            )));
        }
        return Ok(Arc::new(HeaderResolver::new(&trimmed[7..])));
    }

    match lower.as_str() {
        "ip" => Ok(Arc::new(IpResolver)),
        "user" | "user-id" => Ok(Arc::new(UserResolver)),
        "sub" => Ok(Arc::new(SubResolver)),
        "api-key" => Ok(Arc::new(HeaderResolver::new("X-Api-Key"))),
        "client-id" => Ok(Arc::new(ClientIdResolver)),
        _ => Err(LimiterError::Configuration(format!(
            "Unknown key resolver spec '{}'",
            trimmed
        ))),
    }
}

/// Compile an ordered list of resolver specs into a single resolver.
///
/// One spec compiles to itself; several compose into a [`CompositeResolver`].
/// An unknown spec is a configuration error naming the spec.
pub fn compile_specs(specs: &[String]) -> Result<Arc<dyn KeyResolver>> {
    if specs.is_empty() {
        return Err(LimiterError::Configuration(
            "Key resolver spec list is empty".to_string(),
        ));
    }

    let mut resolvers = Vec::with_capacity(specs.len());
    for spec in specs {
        resolvers.push(parse_spec(spec)?);
    }

    Ok(match resolvers.len() {
        1 => resolvers.remove(0),
        _ => Arc::new(CompositeResolver::new(resolvers)),
    })
}

/// The default resolver injected when a policy specifies none
pub fn default_resolver() -> Arc<dyn KeyResolver> {
    Arc::new(IpResolver)
}
