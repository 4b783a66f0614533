//! Middleware integration tests driving an axum router end to end.

mod common;

use common::CountingStore;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::IntoResponse,
    routing::get,
    Extension, Router,
};
use elf_access_limiter::{
    Policy, PolicyProvider, RateLimitMeta, RateLimiter, RateLimiterOptions,
};
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::Duration;

async fn handler() -> impl IntoResponse {
    "ok"
}

fn shared_bucket_policy() -> Policy {
    Policy::builder("exports")
        .limit(3)
        .window(Duration::from_secs(60))
        .shared_bucket("exports")
        .key_resolvers(["header:X-Api-Key"])
        .build()
        .unwrap()
}

fn limiter_with(
    policies: Vec<Policy>,
    store: Arc<dyn elf_access_limiter::RateLimitStore>,
    options: RateLimiterOptions,
) -> RateLimiter {
    let provider = Arc::new(PolicyProvider::new(policies, None).unwrap());
    RateLimiter::new(provider, store, options)
}

fn request(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-api-key", "caller-1")
        .body(Body::empty())
        .unwrap()
}

/// A shared bucket spans endpoints: three allowed calls across two routes,
/// the fourth is denied regardless of which route it hits.
#[tokio::test]
async fn shared_bucket_spans_endpoints() {
    common::init_tracing();
    let limiter = limiter_with(
        vec![shared_bucket_policy()],
        Arc::new(CountingStore::new()),
        RateLimiterOptions::default(),
    );

    let app = Router::new()
        .route("/a", get(handler))
        .route("/b", get(handler))
        .layer(limiter.layer_for("exports"));

    for uri in ["/a", "/b", "/a"] {
        let response = tower::ServiceExt::oneshot(app.clone(), request(uri))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "call to {} should pass", uri);
    }

    let response = tower::ServiceExt::oneshot(app.clone(), request("/b"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn allowed_responses_carry_rate_limit_headers() {
    let limiter = limiter_with(
        vec![shared_bucket_policy()],
        Arc::new(CountingStore::new()),
        RateLimiterOptions::default(),
    );
    let app = Router::new()
        .route("/a", get(handler))
        .layer(limiter.layer_for("exports"));

    let response = tower::ServiceExt::oneshot(app, request("/a")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let headers = response.headers();
    assert_eq!(headers["x-ratelimit-limit"], "3");
    assert_eq!(headers["x-ratelimit-remaining"], "2");
    let reset: i64 = headers["x-ratelimit-reset"].to_str().unwrap().parse().unwrap();
    assert!(reset > 0);
}

#[tokio::test]
async fn denial_shapes_status_headers_and_body() {
    let limiter = limiter_with(
        vec![Policy::builder("tight")
            .limit(1)
            .window(Duration::from_secs(60))
            .key_resolvers(["header:X-Api-Key"])
            .build()
            .unwrap()],
        Arc::new(CountingStore::new()),
        RateLimiterOptions::default(),
    );
    let app = Router::new()
        .route("/a", get(handler))
        .layer(limiter.layer_for("tight"));

    let response = tower::ServiceExt::oneshot(app.clone(), request("/a"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = tower::ServiceExt::oneshot(app, request("/a")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let headers = response.headers();
    let retry_after: u64 = headers["retry-after"].to_str().unwrap().parse().unwrap();
    assert!(retry_after > 0);
    assert_eq!(headers["content-type"], "application/json");
    assert_eq!(headers["x-ratelimit-remaining"], "0");

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "rate_limited");
}

/// An exempt request never reaches the store.
#[tokio::test]
async fn exempt_requests_produce_zero_store_writes() {
    let store = Arc::new(CountingStore::new());
    let options = RateLimiterOptions::builder()
        .exempt_when(Arc::new(|ctx| ctx.header("X-Internal-Token").is_some()))
        .build();
    let limiter = limiter_with(vec![shared_bucket_policy()], store.clone(), options);
    let app = Router::new()
        .route("/a", get(handler))
        .layer(limiter.layer_for("exports"));

    let req = Request::builder()
        .uri("/a")
        .header("x-api-key", "caller-1")
        .header("x-internal-token", "1")
        .body(Body::empty())
        .unwrap();
    let response = tower::ServiceExt::oneshot(app, req).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(store.evaluations(), 0);
}

/// An unknown policy name logs and lets the request through untouched.
#[tokio::test]
async fn unknown_policy_passes_through() {
    let store = Arc::new(CountingStore::new());
    let limiter = limiter_with(
        vec![shared_bucket_policy()],
        store.clone(),
        RateLimiterOptions::default(),
    );
    let app = Router::new()
        .route("/a", get(handler))
        .layer(limiter.layer_for("reports"));

    let response = tower::ServiceExt::oneshot(app, request("/a")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-ratelimit-limit").is_none());
    assert_eq!(store.evaluations(), 0);
}

/// Request-level metadata overrides the layer's policy selection.
#[tokio::test]
async fn request_extension_metadata_wins() {
    let store = Arc::new(CountingStore::new());
    let limiter = limiter_with(
        vec![
            shared_bucket_policy(),
            Policy::builder("tight")
                .limit(1)
                .window(Duration::from_secs(60))
                .key_resolvers(["header:X-Api-Key"])
                .build()
                .unwrap(),
        ],
        store.clone(),
        RateLimiterOptions::default(),
    );

    let app = Router::new()
        .route("/a", get(handler))
        .layer(limiter.layer_for("exports"))
        .layer(Extension(RateLimitMeta::policy("tight")));

    let response = tower::ServiceExt::oneshot(app.clone(), request("/a"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-ratelimit-limit"], "1");

    let response = tower::ServiceExt::oneshot(app, request("/a")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

/// Headers can be turned off wholesale; Retry-After stays.
#[tokio::test]
async fn emit_headers_toggle() {
    let options = RateLimiterOptions::builder().emit_headers(false).build();
    let limiter = limiter_with(
        vec![Policy::builder("tight")
            .limit(1)
            .window(Duration::from_secs(60))
            .key_resolvers(["header:X-Api-Key"])
            .build()
            .unwrap()],
        Arc::new(CountingStore::new()),
        options,
    );
    let app = Router::new()
        .route("/a", get(handler))
        .layer(limiter.layer_for("tight"));

    let response = tower::ServiceExt::oneshot(app.clone(), request("/a"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-ratelimit-limit").is_none());

    let response = tower::ServiceExt::oneshot(app, request("/a")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().get("retry-after").is_some());
    assert!(response.headers().get("x-ratelimit-limit").is_none());
}

/// A custom rejection handler writes the body; the shaper keeps status and
/// headers.
#[tokio::test]
async fn custom_rejection_handler() {
    let options = RateLimiterOptions::builder()
        .on_rejected(Arc::new(|_req, decision| {
            (
                StatusCode::OK,
                [("content-type", "text/plain")],
                format!("try again in {}s", decision.retry_after.as_secs()),
            )
                .into_response()
        }))
        .build();
    let limiter = limiter_with(
        vec![Policy::builder("tight")
            .limit(1)
            .window(Duration::from_secs(60))
            .key_resolvers(["header:X-Api-Key"])
            .build()
            .unwrap()],
        Arc::new(CountingStore::new()),
        options,
    );
    let app = Router::new()
        .route("/a", get(handler))
        .layer(limiter.layer_for("tight"));

    tower::ServiceExt::oneshot(app.clone(), request("/a"))
        .await
        .unwrap();
    let response = tower::ServiceExt::oneshot(app, request("/a")).await.unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["content-type"], "text/plain");

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.starts_with("try again in"));
}

/// Separate API keys do not share a bucket even on a shared scope.
#[tokio::test]
async fn callers_are_isolated() {
    let limiter = limiter_with(
        vec![Policy::builder("tight")
            .limit(1)
            .window(Duration::from_secs(60))
            .key_resolvers(["header:X-Api-Key"])
            .build()
            .unwrap()],
        Arc::new(CountingStore::new()),
        RateLimiterOptions::default(),
    );
    let app = Router::new()
        .route("/a", get(handler))
        .layer(limiter.layer_for("tight"));

    let response = tower::ServiceExt::oneshot(app.clone(), request("/a"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let other = Request::builder()
        .uri("/a")
        .header("x-api-key", "caller-2")
        .body(Body::empty())
        .unwrap();
    let response = tower::ServiceExt::oneshot(app.clone(), other).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = tower::ServiceExt::oneshot(app, request("/a")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}
