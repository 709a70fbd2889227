use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::error;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref RECONCILE_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("devconsole_reconcile_total", "Reconciliations by kind and result."),
        &["kind", "result"]
    )
    .unwrap_or_else(|e| panic!("invalid reconcile counter: {}", e));
    pub static ref STALE_WRITES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "devconsole_stale_writes_total",
            "Writes discarded for carrying an older resource version.",
        ),
        &["kind"]
    )
    .unwrap_or_else(|e| panic!("invalid stale write counter: {}", e));
    pub static ref TENANT_CACHE_MISSES_TOTAL: IntCounter = IntCounter::new(
        "devconsole_tenant_cache_misses_total",
        "Tenant clients built because none was cached."
    )
    .unwrap_or_else(|e| panic!("invalid tenant cache counter: {}", e));
}

/// Registers every collector with [`REGISTRY`]. Safe to call more than once.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(RECONCILE_TOTAL.clone()),
        Box::new(STALE_WRITES_TOTAL.clone()),
        Box::new(TENANT_CACHE_MISSES_TOTAL.clone()),
    ];
    for collector in collectors {
        if let Err(e) = REGISTRY.register(collector) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                error!("Failed to register metric: {}", e);
            }
        }
    }
}

pub fn record_reconcile(kind: &str, result: &str) {
    RECONCILE_TOTAL.with_label_values(&[kind, result]).inc();
}

pub fn record_stale_write(kind: &str) {
    STALE_WRITES_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_tenant_cache_miss() {
    TENANT_CACHE_MISSES_TOTAL.inc();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder.encode_to_string(&metric_families).unwrap_or_else(|e| {
        error!("Failed to encode metrics: {}", e);
        String::new()
    })
}
