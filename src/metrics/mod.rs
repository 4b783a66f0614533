//! Decision metrics hooks.
//!
//! Sinks must be non-blocking; the middleware calls them inline on the
//! request path. A panicking sink is contained and logged, never allowed
//! to corrupt the decision path.

mod prometheus;

pub use self::prometheus::{
    init_rate_limiter_metrics, PrometheusSink, RateLimiterMetrics, RATE_LIMITER_METRICS,
};

use crate::driver::Decision;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Observer of rate-limit decisions
pub trait MetricsSink: Send + Sync {
    /// A request passed within its limits
    fn on_allowed(&self, decision: &Decision);

    /// A request was denied by the token bucket
    fn on_limited(&self, decision: &Decision);

    /// A request was denied by an active penalty block
    fn on_blocked(&self, decision: &Decision);
}

/// Sink that ignores every decision
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn on_allowed(&self, _decision: &Decision) {}
    fn on_limited(&self, _decision: &Decision) {}
    fn on_blocked(&self, _decision: &Decision) {}
}

/// Dispatch a decision to the sink with panic containment
pub(crate) fn emit(sink: &dyn MetricsSink, decision: &Decision) {
    let result = catch_unwind(AssertUnwindSafe(|| {
        if decision.allowed {
            sink.on_allowed(decision);
        } else if decision.blocked {
            sink.on_blocked(decision);
        } else {
            sink.on_limited(decision);
        }
    }));

    if result.is_err() {
        tracing::warn!(policy = %decision.policy, "Metrics sink panicked; decision unaffected");
    }
}
