//! Prometheus metrics for rate-limit decisions.

use crate::driver::Decision;
use crate::metrics::MetricsSink;
use lazy_static::lazy_static;
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};

/// Container for all rate limiter metrics
pub struct RateLimiterMetrics {
    /// Total decisions by policy and outcome (allowed/limited/blocked)
    pub decisions_total: CounterVec,

    /// Total violations recorded on denials
    pub violations_total: CounterVec,

    /// Retry-after durations handed to denied callers
    pub retry_after_seconds: HistogramVec,
}

impl RateLimiterMetrics {
    fn new() -> Self {
        Self {
            decisions_total: CounterVec::new(
                Opts::new(
                    "rate_limiter_decisions_total",
                    "Total rate-limit decisions by outcome",
                )
                .namespace("elf_access_limiter"),
                &["policy", "outcome"],
            )
            .expect("Failed to create rate_limiter_decisions_total metric"),

            violations_total: CounterVec::new(
                Opts::new(
                    "rate_limiter_violations_total",
                    "Total violations recorded on denials",
                )
                .namespace("elf_access_limiter"),
                &["policy"],
            )
            .expect("Failed to create rate_limiter_violations_total metric"),

            retry_after_seconds: HistogramVec::new(
                HistogramOpts::new(
                    "rate_limiter_retry_after_seconds",
                    "Retry-after durations handed to denied callers",
                )
                .namespace("elf_access_limiter")
                .buckets(vec![1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0, 3600.0]),
                &["policy"],
            )
            .expect("Failed to create rate_limiter_retry_after_seconds metric"),
        }
    }
}

lazy_static! {
    /// Global rate limiter metrics instance
    pub static ref RATE_LIMITER_METRICS: RateLimiterMetrics = RateLimiterMetrics::new();
}

/// Initialize rate limiter metrics with the Prometheus registry
pub fn init_rate_limiter_metrics(registry: &Registry) -> Result<(), prometheus::Error> {
    registry.register(Box::new(RATE_LIMITER_METRICS.decisions_total.clone()))?;
    registry.register(Box::new(RATE_LIMITER_METRICS.violations_total.clone()))?;
    registry.register(Box::new(RATE_LIMITER_METRICS.retry_after_seconds.clone()))?;

    tracing::info!("Rate limiter metrics initialized");
    Ok(())
}

/// Sink recording decisions into the global Prometheus metrics
pub struct PrometheusSink;

impl PrometheusSink {
    fn record_denial(&self, decision: &Decision, outcome: &str) {
        RATE_LIMITER_METRICS
            .decisions_total
            .with_label_values(&[&decision.policy, outcome])
            .inc();
        RATE_LIMITER_METRICS
            .retry_after_seconds
            .with_label_values(&[&decision.policy])
            .observe(decision.retry_after.as_secs_f64());
        if decision.violations > 0 {
            RATE_LIMITER_METRICS
                .violations_total
                .with_label_values(&[&decision.policy])
                .inc();
        }
    }
}

impl MetricsSink for PrometheusSink {
    fn on_allowed(&self, decision: &Decision) {
        RATE_LIMITER_METRICS
            .decisions_total
            .with_label_values(&[&decision.policy, "allowed"])
            .inc();
    }

    fn on_limited(&self, decision: &Decision) {
        self.record_denial(decision, "limited");
    }

    fn on_blocked(&self, decision: &Decision) {
        self.record_denial(decision, "blocked");
    }
}
