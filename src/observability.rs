use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: slot-level operations executed. Labels: op, status.
pub const SLOT_OPS_TOTAL: &str = "freebusy_slot_ops_total";

/// Histogram: slot-level operation latency in seconds. Labels: op.
pub const SLOT_OP_DURATION_SECONDS: &str = "freebusy_slot_op_duration_seconds";

/// Counter: bulk week operations executed. Labels: op.
pub const WEEK_OPS_TOTAL: &str = "freebusy_week_ops_total";

/// Counter: dates processed by bulk operations.
pub const BULK_DATES_TOTAL: &str = "freebusy_bulk_dates_total";

/// Counter: conflicts detected by any check path.
pub const CONFLICTS_FOUND_TOTAL: &str = "freebusy_conflicts_found_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: instructor calendars held in memory.
pub const CALENDARS_ACTIVE: &str = "freebusy_calendars_active";

/// Counter: week-pattern cache hits.
pub const CACHE_HITS_TOTAL: &str = "freebusy_cache_hits_total";

/// Counter: week-pattern cache misses.
pub const CACHE_MISSES_TOTAL: &str = "freebusy_cache_misses_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "freebusy_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "freebusy_wal_flush_batch_size";

/// Install the Prometheus metrics exporter on the given port. No-op if
/// `port` is None. Call once from the embedding process.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Install a default fmt tracing subscriber. Safe to call more than once;
/// later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}
