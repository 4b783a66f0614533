//! HTTP middleware: drives the decision pipeline and shapes responses.

use crate::context::{AuthContext, RateLimitMeta, RequestContext};
use crate::driver::{Decision, DecisionDriver, Outcome};
use crate::metrics;
use axum::{
    body::Body,
    extract::{ConnectInfo, MatchedPath},
    http::{header, HeaderMap, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

const LIMIT_HEADER: &str = "x-ratelimit-limit";
const REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RESET_HEADER: &str = "x-ratelimit-reset";

/// Middleware layer applying one rate-limit policy selection
#[derive(Clone)]
pub struct RateLimitLayer {
    driver: Arc<DecisionDriver>,
    meta: RateLimitMeta,
}

impl RateLimitLayer {
    /// Create a layer with no layer-level metadata; policy selection comes
    /// from request extensions or the configured default
    pub fn new(driver: Arc<DecisionDriver>) -> Self {
        Self {
            driver,
            meta: RateLimitMeta::default(),
        }
    }

    /// Create a layer selecting the given policy for every request it wraps
    pub fn with_policy(driver: Arc<DecisionDriver>, policy: impl Into<String>) -> Self {
        Self {
            driver,
            meta: RateLimitMeta::policy(policy),
        }
    }

    /// Create a layer with full layer-level metadata
    pub fn with_meta(driver: Arc<DecisionDriver>, meta: RateLimitMeta) -> Self {
        Self { driver, meta }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            driver: self.driver.clone(),
            meta: self.meta.clone(),
        }
    }
}

/// Middleware service evaluating every request against the decision driver
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    driver: Arc<DecisionDriver>,
    meta: RateLimitMeta,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let driver = self.driver.clone();
        let layer_meta = self.meta.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let meta = match req.extensions().get::<RateLimitMeta>() {
                Some(request_meta) => request_meta.merged_over(&layer_meta),
                None => layer_meta,
            };

            let outcome = {
                let route = req
                    .extensions()
                    .get::<MatchedPath>()
                    .map(|path| path.as_str());
                let remote_addr = req
                    .extensions()
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|info| info.0);
                let ctx = RequestContext {
                    headers: req.headers(),
                    remote_addr,
                    path: req.uri().path(),
                    route,
                    endpoint_name: None,
                    auth: req.extensions().get::<AuthContext>(),
                };
                driver.evaluate(&ctx, &meta).await
            };

            let options = driver.options().clone();

            match outcome {
                Ok(Outcome::Bypass(_)) => inner.call(req).await,

                Ok(Outcome::Allowed(decision)) => {
                    metrics::emit(&*options.metrics, &decision);
                    let mut response = inner.call(req).await?;
                    if options.emit_headers {
                        attach_rate_limit_headers(response.headers_mut(), &decision);
                    }
                    Ok(response)
                }

                Ok(Outcome::Denied(decision)) => {
                    metrics::emit(&*options.metrics, &decision);
                    Ok(rejection_response(&options, &req, &decision))
                }

                // Fail-closed store failure: an infrastructure error, never
                // presented as a limit.
                Err(e) => Ok(e.into_response()),
            }
        })
    }
}

fn attach_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(LIMIT_HEADER, HeaderValue::from(decision.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
    headers.insert(RESET_HEADER, HeaderValue::from(decision.reset.timestamp()));
}

/// Shape a denial: status and headers first, then the body (custom handler
/// or the configured body/content-type pair).
fn rejection_response(
    options: &crate::config::RateLimiterOptions,
    req: &Request<Body>,
    decision: &Decision,
) -> Response {
    let mut response = match &options.on_rejected {
        Some(handler) => handler(req, decision),
        None => (
            StatusCode::TOO_MANY_REQUESTS,
            [(
                header::CONTENT_TYPE,
                options.rejection_content_type.clone(),
            )],
            options.rejection_body.clone(),
        )
            .into_response(),
    };

    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;

    let headers = response.headers_mut();
    headers.insert(
        header::RETRY_AFTER,
        HeaderValue::from(decision.retry_after.as_secs()),
    );
    if options.emit_headers {
        attach_rate_limit_headers(headers, decision);
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimiterOptions;
    use crate::policy::{Policy, PolicyProvider};
    use crate::store::InMemoryStore;
    use chrono::Utc;
    use std::time::Duration;

    fn driver() -> Arc<DecisionDriver> {
        let policy = Policy::builder("api")
            .limit(3)
            .window(Duration::from_secs(10))
            .build()
            .unwrap();
        let provider = Arc::new(PolicyProvider::new(vec![policy], None).unwrap());
        Arc::new(DecisionDriver::new(
            provider,
            Arc::new(InMemoryStore::new()),
            Arc::new(RateLimiterOptions::default()),
        ))
    }

    fn decision(allowed: bool) -> Decision {
        Decision {
            policy: "api".to_string(),
            scope: "default".to_string(),
            key_hash: "00".repeat(32),
            limit: 3,
            remaining: if allowed { 2 } else { 0 },
            cost: 1,
            retry_after: if allowed {
                Duration::ZERO
            } else {
                Duration::from_secs(4)
            },
            reset: Utc::now(),
            allowed,
            blocked: false,
            violations: 0,
        }
    }

    #[test]
    fn test_layer_creation() {
        let layer = RateLimitLayer::with_policy(driver(), "api");
        assert_eq!(layer.meta.policy.as_deref(), Some("api"));

        let layer = RateLimitLayer::new(driver());
        assert_eq!(layer.meta, RateLimitMeta::default());
    }

    #[test]
    fn test_rate_limit_headers() {
        let mut headers = HeaderMap::new();
        let d = decision(true);
        attach_rate_limit_headers(&mut headers, &d);

        assert_eq!(headers[LIMIT_HEADER], "3");
        assert_eq!(headers[REMAINING_HEADER], "2");
        assert_eq!(
            headers[RESET_HEADER].to_str().unwrap(),
            d.reset.timestamp().to_string()
        );
    }

    #[test]
    fn test_rejection_response_shape() {
        let options = RateLimiterOptions::default();
        let req = Request::builder().body(Body::empty()).unwrap();
        let d = decision(false);

        let response = rejection_response(&options, &req, &d);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "4");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        assert_eq!(response.headers()[LIMIT_HEADER], "3");
        assert_eq!(response.headers()[REMAINING_HEADER], "0");
    }

    #[test]
    fn test_rejection_with_headers_disabled() {
        let options = RateLimiterOptions::builder().emit_headers(false).build();
        let req = Request::builder().body(Body::empty()).unwrap();

        let response = rejection_response(&options, &req, &decision(false));
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        // Retry-After is always present on denial.
        assert_eq!(response.headers()[header::RETRY_AFTER], "4");
        assert!(response.headers().get(LIMIT_HEADER).is_none());
    }

    #[test]
    fn test_custom_rejection_handler_owns_the_body() {
        let options = RateLimiterOptions::builder()
            .on_rejected(Arc::new(|_req, decision| {
                (
                    StatusCode::OK,
                    format!("slow down, retry in {}s", decision.retry_after.as_secs()),
                )
                    .into_response()
            }))
            .build();
        let req = Request::builder().body(Body::empty()).unwrap();

        let response = rejection_response(&options, &req, &decision(false));
        // The shaper still owns status and headers.
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "4");
    }
}
