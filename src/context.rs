//! Request-side context consumed by key resolvers and the decision driver.

use axum::http::HeaderMap;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Authenticated caller information, populated by authentication middleware
/// and attached to the request as an extension.
///
/// The `user` / `user-id` resolver specs read [`AuthContext::user_id`]; the
/// `sub` and `claim:<type>` specs read the claim map.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    /// Whether the caller presented valid credentials
    pub is_authenticated: bool,

    /// Stable identifier of the authenticated principal
    pub user_id: Option<String>,

    /// Verified claims (for example a decoded JWT payload)
    pub claims: HashMap<String, String>,
}

impl AuthContext {
    /// Create an authenticated context for the given principal
    pub fn authenticated(user_id: impl Into<String>) -> Self {
        Self {
            is_authenticated: true,
            user_id: Some(user_id.into()),
            claims: HashMap::new(),
        }
    }

    /// Create an anonymous context
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Attach a claim
    pub fn with_claim(mut self, claim_type: impl Into<String>, value: impl Into<String>) -> Self {
        self.claims.insert(claim_type.into(), value.into());
        self
    }

    /// Look up a claim value by type
    pub fn claim(&self, claim_type: &str) -> Option<&str> {
        self.claims.get(claim_type).map(String::as_str)
    }
}

/// Endpoint rate-limit metadata, attached to requests (or layers) to select
/// the policy and optionally pin the scope or cost.
///
/// When both a layer-level and a request-level value exist they merge
/// field-by-field with the request value winning, so the innermost
/// annotation decides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitMeta {
    /// Policy name; without one (and without a global default) the request
    /// bypasses limiting
    pub policy: Option<String>,

    /// Explicit bucket scope, overriding shared-bucket and route scoping
    pub scope: Option<String>,

    /// Explicit cost, overriding the policy cost when greater than zero
    pub cost: Option<u64>,
}

impl RateLimitMeta {
    /// Metadata selecting a policy by name
    pub fn policy(name: impl Into<String>) -> Self {
        Self {
            policy: Some(name.into()),
            ..Default::default()
        }
    }

    /// Pin the bucket scope
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Pin the request cost
    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = Some(cost);
        self
    }

    /// Merge this metadata over a base; fields set here win
    pub fn merged_over(&self, base: &RateLimitMeta) -> RateLimitMeta {
        RateLimitMeta {
            policy: self.policy.clone().or_else(|| base.policy.clone()),
            scope: self.scope.clone().or_else(|| base.scope.clone()),
            cost: self.cost.or(base.cost),
        }
    }
}

/// Borrowed view of one HTTP request, assembled by the middleware once per
/// request and handed to resolvers and predicates.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'r> {
    /// Request headers
    pub headers: &'r HeaderMap,

    /// Transport-level peer address, when the server exposes it
    pub remote_addr: Option<SocketAddr>,

    /// Raw request path
    pub path: &'r str,

    /// Matched route pattern (for example `/exports/:id`), when routing
    /// metadata is available
    pub route: Option<&'r str>,

    /// Human-readable endpoint name, when one is configured
    pub endpoint_name: Option<&'r str>,

    /// Authenticated caller context, when authentication middleware ran
    pub auth: Option<&'r AuthContext>,
}

impl<'r> RequestContext<'r> {
    /// First value of a header, as UTF-8
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Whether any of the given headers is present with a non-empty value
    pub fn any_header_present(&self, names: &[String]) -> bool {
        names
            .iter()
            .any(|name| self.header(name).is_some_and(|v| !v.trim().is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn context(headers: &HeaderMap) -> RequestContext<'_> {
        RequestContext {
            headers,
            remote_addr: None,
            path: "/",
            route: None,
            endpoint_name: None,
            auth: None,
        }
    }

    #[test]
    fn test_header_lookup() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("secret"));

        let ctx = context(&headers);
        assert_eq!(ctx.header("X-Api-Key"), Some("secret"));
        assert_eq!(ctx.header("missing"), None);
    }

    #[test]
    fn test_any_header_present_ignores_empty_values() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("  "));

        let ctx = context(&headers);
        assert!(!ctx.any_header_present(&["Authorization".to_string()]));

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer t"));
        let ctx = context(&headers);
        assert!(ctx.any_header_present(&["Authorization".to_string()]));
    }

    #[test]
    fn test_meta_merge_request_wins() {
        let layer = RateLimitMeta::policy("downloads").with_cost(2);
        let request = RateLimitMeta::policy("exports").with_scope("bulk");

        let merged = request.merged_over(&layer);
        assert_eq!(merged.policy.as_deref(), Some("exports"));
        assert_eq!(merged.scope.as_deref(), Some("bulk"));
        assert_eq!(merged.cost, Some(2));
    }

    #[test]
    fn test_auth_context_claims() {
        let auth = AuthContext::authenticated("user-7").with_claim("sub", "abc");
        assert!(auth.is_authenticated);
        assert_eq!(auth.user_id.as_deref(), Some("user-7"));
        assert_eq!(auth.claim("sub"), Some("abc"));
        assert_eq!(auth.claim("missing"), None);
    }
}
