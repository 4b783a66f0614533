//! Built-in key resolvers.

use crate::context::RequestContext;
use crate::error::Result;
use crate::resolver::KeyResolver;
use async_trait::async_trait;
use std::net::IpAddr;

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Clean one forwarded-address candidate and keep it only if it parses.
///
/// Strips `[...]` IPv6 brackets (and anything trailing them), and strips a
/// trailing `:port` only when the text has exactly one colon and a dot, so
/// bare IPv6 addresses survive untouched.
fn parse_forwarded_candidate(raw: &str) -> Option<String> {
    let mut candidate = raw.trim();
    if candidate.is_empty() {
        return None;
    }

    if candidate.starts_with('[') {
        match candidate.find(']') {
            Some(end) => candidate = &candidate[1..end],
            None => return None,
        }
    } else if candidate.matches(':').count() == 1 && candidate.contains('.') {
        if let Some(index) = candidate.find(':') {
            candidate = &candidate[..index];
        }
    }

    candidate.parse::<IpAddr>().ok().map(|ip| ip.to_string())
}

/// Client IP resolver: forwarded headers first, then the transport peer.
pub struct IpResolver;

#[async_trait]
impl KeyResolver for IpResolver {
    async fn resolve(&self, ctx: &RequestContext<'_>) -> Result<Option<String>> {
        for header in ["X-Forwarded-For", "X-Real-IP"] {
            if let Some(value) = ctx.header(header) {
                if let Some(ip) = value.split(',').find_map(parse_forwarded_candidate) {
                    return Ok(Some(ip));
                }
            }
        }

        Ok(ctx.remote_addr.map(|addr| addr.ip().to_string()))
    }
}

/// Identity of the authenticated principal; `None` for anonymous callers.
pub struct UserResolver;

#[async_trait]
impl KeyResolver for UserResolver {
    async fn resolve(&self, ctx: &RequestContext<'_>) -> Result<Option<String>> {
        let user = ctx
            .auth
            .filter(|auth| auth.is_authenticated)
            .and_then(|auth| auth.user_id.as_deref());
        Ok(non_empty(user))
    }
}

/// The `sub` claim.
pub struct SubResolver;

#[async_trait]
impl KeyResolver for SubResolver {
    async fn resolve(&self, ctx: &RequestContext<'_>) -> Result<Option<String>> {
        Ok(non_empty(ctx.auth.and_then(|auth| auth.claim("sub"))))
    }
}

/// An arbitrary claim type.
pub struct ClaimResolver {
    claim_type: String,
}

impl ClaimResolver {
    pub fn new(claim_type: impl Into<String>) -> Self {
        Self {
            claim_type: claim_type.into(),
        }
    }
}

#[async_trait]
impl KeyResolver for ClaimResolver {
    async fn resolve(&self, ctx: &RequestContext<'_>) -> Result<Option<String>> {
        Ok(non_empty(
            ctx.auth.and_then(|auth| auth.claim(&self.claim_type)),
        ))
    }
}

/// An arbitrary header; first value wins.
pub struct HeaderResolver {
    name: String,
}

impl HeaderResolver {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl KeyResolver for HeaderResolver {
    async fn resolve(&self, ctx: &RequestContext<'_>) -> Result<Option<String>> {
        Ok(non_empty(ctx.header(&self.name)))
    }
}

/// The `X-Client-Id` header.
pub struct ClientIdResolver;

#[async_trait]
impl KeyResolver for ClientIdResolver {
    async fn resolve(&self, ctx: &RequestContext<'_>) -> Result<Option<String>> {
        Ok(non_empty(ctx.header("X-Client-Id")))
    }
}
