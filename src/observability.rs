use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests served. Labels: route, status.
pub const HTTP_REQUESTS_TOTAL: &str = "evshare_http_requests_total";

/// Histogram: HTTP handler latency in seconds. Labels: route.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "evshare_http_request_duration_seconds";

/// Counter: admission decisions. Labels: outcome (admitted/rejected).
pub const ADMISSIONS_TOTAL: &str = "evshare_admissions_total";

/// Counter: decisions that had to resolve at least one conflict.
pub const CONFLICTS_TOTAL: &str = "evshare_conflicts_total";

/// Counter: existing bookings rejected because a candidate outranked them.
pub const BOOKINGS_DISPLACED_TOTAL: &str = "evshare_bookings_displaced_total";

/// Histogram: time spent inside a vehicle's critical section during evaluate.
pub const EVALUATION_DURATION_SECONDS: &str = "evshare_evaluation_duration_seconds";

/// Counter: rejected requests that got no alternative slot.
pub const NO_AVAILABILITY_TOTAL: &str = "evshare_no_availability_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: registered vehicles.
pub const VEHICLES_ACTIVE: &str = "evshare_vehicles_active";

/// Counter: bookings completed by the reaper.
pub const BOOKINGS_COMPLETED_TOTAL: &str = "evshare_bookings_completed_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "evshare_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "evshare_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
