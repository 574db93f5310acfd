//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `configmapsecret_controller_missing_value_render_errors_total` - Render
//!   errors due to missing required values, labeled by namespace
//! - `configmapsecret_reconciliations_total` - Total number of reconciles
//! - `configmapsecret_reconciliation_errors_total` - Total reconcile errors
//! - `configmapsecret_reconcile_duration_seconds` - Reconcile duration

use anyhow::Result;
use prometheus::{Histogram, HistogramOpts, HistogramTimer, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static MISSING_VALUE_RENDER_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "configmapsecret_controller_missing_value_render_errors_total",
            "Total number of ConfigMapSecret controller render errors due to missing required values.",
        ),
        &["namespace"],
    )
    .expect("valid metric definition")
});

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "configmapsecret_reconciliations_total",
        "Total number of ConfigMapSecret reconciles.",
    )
    .expect("valid metric definition")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "configmapsecret_reconciliation_errors_total",
        "Total number of ConfigMapSecret reconcile errors.",
    )
    .expect("valid metric definition")
});

static RECONCILE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "configmapsecret_reconcile_duration_seconds",
            "Duration of ConfigMapSecret reconciles in seconds.",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
    )
    .expect("valid metric definition")
});

/// Registers all controller metrics on the crate registry.
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(MISSING_VALUE_RENDER_ERRORS.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILE_DURATION.clone()))?;
    Ok(())
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors() {
    RECONCILIATION_ERRORS_TOTAL.inc();
}

pub fn increment_missing_value_render_errors(namespace: &str) {
    MISSING_VALUE_RENDER_ERRORS
        .with_label_values(&[namespace])
        .inc();
}

/// Current missing-value render error count for a namespace.
pub fn missing_value_render_errors(namespace: &str) -> u64 {
    MISSING_VALUE_RENDER_ERRORS
        .with_label_values(&[namespace])
        .get()
}

/// Starts a timer observed into the reconcile duration histogram.
pub fn reconcile_timer() -> HistogramTimer {
    RECONCILE_DURATION.start_timer()
}
