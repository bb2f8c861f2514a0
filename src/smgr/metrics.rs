//! Prometheus metrics for the storage manager

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Storage manager metrics registry
    pub static ref SMGR_METRICS: Registry = Registry::new();

    pub static ref HANDLES_OPEN: IntGauge = IntGauge::new(
        "photon_smgr_handles_open",
        "Relation handles currently in the registry"
    ).unwrap();

    pub static ref HANDLES_CREATED: IntCounter = IntCounter::new(
        "photon_smgr_handles_created_total",
        "Relation handles created on lookup miss"
    ).unwrap();

    pub static ref FSYNC_TOTAL: IntCounter = IntCounter::new(
        "photon_smgr_fsync_total",
        "Forced fork syncs issued"
    ).unwrap();

    pub static ref UNLINK_FAILURES: IntCounter = IntCounter::new(
        "photon_smgr_unlink_failures_total",
        "Physical unlinks downgraded to warnings"
    ).unwrap();

    pub static ref INVALIDATIONS_SENT: IntCounter = IntCounter::new(
        "photon_smgr_invalidations_sent_total",
        "Invalidation notices broadcast"
    ).unwrap();
}

/// Register all storage manager metrics. Safe to call more than once.
pub fn register_metrics() {
    SMGR_METRICS.register(Box::new(HANDLES_OPEN.clone())).ok();
    SMGR_METRICS.register(Box::new(HANDLES_CREATED.clone())).ok();
    SMGR_METRICS.register(Box::new(FSYNC_TOTAL.clone())).ok();
    SMGR_METRICS.register(Box::new(UNLINK_FAILURES.clone())).ok();
    SMGR_METRICS.register(Box::new(INVALIDATIONS_SENT.clone())).ok();
    info!("Storage manager metrics registered");
}

/// Export storage manager metrics in Prometheus text format
pub fn export_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = SMGR_METRICS.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|_| String::from("# Error converting metrics\n"))
}
