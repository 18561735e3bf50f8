//! # OSB Metrics
//!
//! Metrics for calls made to service brokers.

use crate::observability::metrics::registry::REGISTRY;
use anyhow::Result;
use prometheus::{HistogramVec, IntCounterVec};
use std::sync::LazyLock;

static OSB_REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "service_catalog_osb_requests_total",
            "Total number of broker requests by operation and outcome",
        ),
        &["operation", "outcome"],
    )
    .expect("Failed to create OSB_REQUESTS_TOTAL metric - this should never happen")
});

static OSB_REQUEST_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "service_catalog_osb_request_duration_seconds",
            "Duration of broker requests in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
        &["operation"],
    )
    .expect("Failed to create OSB_REQUEST_DURATION metric - this should never happen")
});

/// Register broker metrics with the registry
pub(crate) fn register_osb_metrics() -> Result<()> {
    REGISTRY.register(Box::new(OSB_REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(OSB_REQUEST_DURATION.clone()))?;
    Ok(())
}

/// Record a finished broker request.
///
/// `outcome` is `success` or `error`.
pub fn record_osb_request(operation: &str, outcome: &str, duration: f64) {
    OSB_REQUESTS_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
    OSB_REQUEST_DURATION
        .with_label_values(&[operation])
        .observe(duration);
}
