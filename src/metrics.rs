//! Prometheus metrics for the broker.
//!
//! The operator-facing introspection surface: pool layout gauges,
//! allocation and reclaim counters, allocation latency. Exported as
//! Prometheus text via `export_metrics`.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use tracing::warn;

lazy_static::lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    // Pool metrics
    pub static ref POOL_CAPACITY_BYTES: IntGaugeVec = IntGaugeVec::new(
        Opts::new("membroker_pool_capacity_bytes", "Pool capacity in bytes"),
        &["pool"]
    ).unwrap();

    pub static ref POOL_ALLOCATED_BYTES: IntGaugeVec = IntGaugeVec::new(
        Opts::new("membroker_pool_allocated_bytes", "Bytes in Allocated state"),
        &["pool"]
    ).unwrap();

    pub static ref POOL_RESERVED_BYTES: IntGaugeVec = IntGaugeVec::new(
        Opts::new("membroker_pool_reserved_bytes", "Bytes in Reserved (idle, evictable) state"),
        &["pool"]
    ).unwrap();

    // Session metrics
    pub static ref ACTIVE_SESSIONS: IntGauge = IntGauge::new(
        "membroker_active_sessions",
        "Number of live client sessions"
    ).unwrap();

    pub static ref ACTIVE_CONNECTIONS: IntGauge = IntGauge::new(
        "membroker_active_connections",
        "Number of open control-channel connections"
    ).unwrap();

    pub static ref SESSIONS_EXPIRED_TOTAL: IntCounter = IntCounter::new(
        "membroker_sessions_expired_total",
        "Sessions killed by heartbeat timeout"
    ).unwrap();

    // Allocation metrics
    pub static ref ALLOCATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("membroker_allocations_total", "Allocation requests by outcome"),
        &["outcome"] // granted, reused, exhausted, rejected
    ).unwrap();

    pub static ref RECLAIMS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("membroker_reclaims_total", "Reclaimed ranges by outcome"),
        &["outcome"] // acked, forced, orphaned
    ).unwrap();

    pub static ref ALLOCATION_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "membroker_allocation_duration_seconds",
            "Allocate latency including any reclamation wait"
        ).buckets(vec![0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5])
    ).unwrap();
}

/// Register all metrics with the global registry. Idempotent.
pub fn init_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(POOL_CAPACITY_BYTES.clone()),
        Box::new(POOL_ALLOCATED_BYTES.clone()),
        Box::new(POOL_RESERVED_BYTES.clone()),
        Box::new(ACTIVE_SESSIONS.clone()),
        Box::new(ACTIVE_CONNECTIONS.clone()),
        Box::new(SESSIONS_EXPIRED_TOTAL.clone()),
        Box::new(ALLOCATIONS_TOTAL.clone()),
        Box::new(RECLAIMS_TOTAL.clone()),
        Box::new(ALLOCATION_DURATION.clone()),
    ];
    for collector in collectors {
        if let Err(e) = METRICS_REGISTRY.register(collector) {
            // AlreadyReg on repeat init is fine; anything else is worth a log.
            if !matches!(e, prometheus::Error::AlreadyReg) {
                warn!("failed to register metric: {}", e);
            }
        }
    }
}

/// Update the pool gauges from a pool's lock-free counters.
pub fn record_pool(pool: &crate::pool::Pool) {
    let label = pool.id().to_string();
    POOL_CAPACITY_BYTES
        .with_label_values(&[&label])
        .set(pool.capacity() as i64);
    POOL_ALLOCATED_BYTES
        .with_label_values(&[&label])
        .set(pool.allocated_bytes() as i64);
    POOL_RESERVED_BYTES
        .with_label_values(&[&label])
        .set(pool.reserved_bytes() as i64);
}

/// Render all metrics in Prometheus text exposition format.
pub fn export_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let families = METRICS_REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(format!("utf-8: {}", e)))
}
