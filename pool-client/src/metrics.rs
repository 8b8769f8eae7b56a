//! Metrics collection for observability
//!
//! Prometheus metrics for one open pool. Each [`PoolMetrics`] owns its
//! registry, so several pools can live in one process.
//!
//! # Metrics
//!
//! - `pool_requests_total{outcome}` - Requests by terminal outcome
//! - `pool_request_duration_seconds` - Histogram of request latencies
//! - `pool_node_failures_total{kind}` - Dial and exchange failures
//! - `pool_verification_failures_total` - Replies that failed verification
//! - `pool_catchup_runs_total{result}` - Catchup runs by result
//! - `pool_catchup_transactions_total` - Transactions appended by catchup
//! - `pool_registry_generation` - Current node registry generation
//! - `pool_open_connections` - Live node connections

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::fmt;
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct PoolMetrics {
    /// Requests by outcome
    pub requests_total: IntCounterVec,

    /// Request duration histogram
    pub request_duration: Histogram,

    /// Node failures by kind
    pub node_failures_total: IntCounterVec,

    /// Replies rejected by the verifier
    pub verification_failures_total: IntCounter,

    /// Catchup runs by result
    pub catchup_runs_total: IntCounterVec,

    /// Transactions appended through catchup
    pub catchup_transactions_total: IntCounter,

    /// Registry generation
    pub registry_generation: IntGauge,

    /// Live connections
    pub open_connections: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl PoolMetrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let requests_total = IntCounterVec::new(
            Opts::new("pool_requests_total", "Requests by terminal outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_duration = Histogram::with_opts(
            HistogramOpts::new("pool_request_duration_seconds", "Histogram of request latencies")
                .buckets(vec![
                    0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0,
                ]),
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        let node_failures_total = IntCounterVec::new(
            Opts::new("pool_node_failures_total", "Dial and exchange failures"),
            &["kind"],
        )?;
        registry.register(Box::new(node_failures_total.clone()))?;

        let verification_failures_total = IntCounter::new(
            "pool_verification_failures_total",
            "Replies that failed verification",
        )?;
        registry.register(Box::new(verification_failures_total.clone()))?;

        let catchup_runs_total = IntCounterVec::new(
            Opts::new("pool_catchup_runs_total", "Catchup runs by result"),
            &["result"],
        )?;
        registry.register(Box::new(catchup_runs_total.clone()))?;

        let catchup_transactions_total = IntCounter::new(
            "pool_catchup_transactions_total",
            "Transactions appended by catchup",
        )?;
        registry.register(Box::new(catchup_transactions_total.clone()))?;

        let registry_generation =
            IntGauge::new("pool_registry_generation", "Current node registry generation")?;
        registry.register(Box::new(registry_generation.clone()))?;

        let open_connections = IntGauge::new("pool_open_connections", "Live node connections")?;
        registry.register(Box::new(open_connections.clone()))?;

        Ok(Self {
            requests_total,
            request_duration,
            node_failures_total,
            verification_failures_total,
            catchup_runs_total,
            catchup_transactions_total,
            registry_generation,
            open_connections,
            registry,
        })
    }

    /// Record a finished request
    pub fn record_request(&self, outcome: &str, duration_seconds: f64) {
        self.requests_total.with_label_values(&[outcome]).inc();
        self.request_duration.observe(duration_seconds);
    }

    /// Record a node failure (`unreachable` or `disconnected`)
    pub fn record_node_failure(&self, kind: &str) {
        self.node_failures_total.with_label_values(&[kind]).inc();
    }

    /// Record a reply that failed verification
    pub fn record_verification_failure(&self) {
        self.verification_failures_total.inc();
    }

    /// Record a catchup run
    pub fn record_catchup(&self, result: &str, appended: usize) {
        self.catchup_runs_total.with_label_values(&[result]).inc();
        self.catchup_transactions_total.inc_by(appended as u64);
    }

    /// Update registry generation
    pub fn set_generation(&self, generation: u64) {
        self.registry_generation.set(generation as i64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl fmt::Debug for PoolMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolMetrics")
            .field("registry_generation", &self.registry_generation.get())
            .field("open_connections", &self.open_connections.get())
            .finish_non_exhaustive()
    }
}
