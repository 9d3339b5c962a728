//! Prometheus counters for payment outcomes, settlement, caches, and the
//! proxy itself, rendered at `GET /metrics` in text-exposition format.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tollbooth_requests_total", "Total number of requests"),
        &["method", "route", "status"]
    ).unwrap();

    /// Labeled `missing|rejected|success`.
    pub static ref PAYMENT_OUTCOMES: IntCounterVec = IntCounterVec::new(
        Opts::new("tollbooth_payment_outcomes_total", "Payment outcomes by kind"),
        &["outcome"]
    ).unwrap();

    /// Labeled `success|failure`.
    pub static ref SETTLEMENT_OUTCOMES: IntCounterVec = IntCounterVec::new(
        Opts::new("tollbooth_settlement_outcomes_total", "Settlement outcomes by kind"),
        &["outcome"]
    ).unwrap();

    /// Labeled `hit|miss`.
    pub static ref VERIFICATION_CACHE: IntCounterVec = IntCounterVec::new(
        Opts::new("tollbooth_verification_cache_total", "Verification cache hit/miss"),
        &["result"]
    ).unwrap();

    pub static ref RATE_LIMIT_BLOCKS: IntCounterVec = IntCounterVec::new(
        Opts::new("tollbooth_rate_limit_blocks_total", "Requests rejected by the rate limiter"),
        &["route"]
    ).unwrap();

    pub static ref PROXY_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new("tollbooth_proxy_latency_seconds", "Upstream proxy latency")
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
    ).unwrap();
}

static REGISTER_ONCE: std::sync::Once = std::sync::Once::new();

/// Register all metrics with the registry. Idempotent; safe to call from
/// both `main` and individual tests.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY.register(Box::new(REQUESTS_TOTAL.clone())).unwrap();
        REGISTRY
            .register(Box::new(PAYMENT_OUTCOMES.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(SETTLEMENT_OUTCOMES.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(VERIFICATION_CACHE.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(RATE_LIMIT_BLOCKS.clone()))
            .unwrap();
        REGISTRY.register(Box::new(PROXY_LATENCY.clone())).unwrap();
    });
}

/// Render the registry in Prometheus text-exposition format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    encoder.encode_to_string(&families).unwrap_or_default()
}
