//! Composite resolver joining ordered component identities.

use crate::context::RequestContext;
use crate::error::Result;
use crate::resolver::KeyResolver;
use async_trait::async_trait;
use std::sync::Arc;

/// Invokes every component in order and joins the non-empty results with
/// `|`. This is composition, not a fallback chain: every component that
/// produces an identity contributes to the key. `None` only when every
/// component comes back empty.
pub struct CompositeResolver {
    resolvers: Vec<Arc<dyn KeyResolver>>,
}

impl CompositeResolver {
    pub fn new(resolvers: Vec<Arc<dyn KeyResolver>>) -> Self {
        Self { resolvers }
    }
}

#[async_trait]
impl KeyResolver for CompositeResolver {
    async fn resolve(&self, ctx: &RequestContext<'_>) -> Result<Option<String>> {
        let mut parts = Vec::with_capacity(self.resolvers.len());

        for resolver in &self.resolvers {
            if let Some(part) = resolver.resolve(ctx).await? {
                if !part.is_empty() {
                    parts.push(part);
                }
            }
        }

        if parts.is_empty() {
            Ok(None)
        } else {
            Ok(Some(parts.join("|")))
        }
    }
}
