use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "shopbook_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "shopbook_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "shopbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "shopbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "shopbook_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "shopbook_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "shopbook_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "shopbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "shopbook_wal_flush_batch_size";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: creates/updates refused because the slot was taken.
pub const BOOKING_CONFLICTS_TOTAL: &str = "shopbook_booking_conflicts_total";

/// Counter: creates/updates refused by working hours.
pub const OUT_OF_HOURS_TOTAL: &str = "shopbook_out_of_hours_total";

/// Counter: appointment count lookups answered from cache.
pub const COUNTS_CACHE_HITS_TOTAL: &str = "shopbook_counts_cache_hits_total";

// ── Optimistic store ────────────────────────────────────────────

/// Counter: optimistic mutations undone after a failed round trip. Labels: kind.
pub const STORE_ROLLBACKS_TOTAL: &str = "shopbook_store_rollbacks_total";

/// Counter: load responses dropped because a newer load superseded them.
pub const STALE_RESPONSES_DISCARDED_TOTAL: &str = "shopbook_stale_responses_discarded_total";

/// Counter: remote pushes ignored (pending local mutation or older payload).
pub const REMOTE_PUSHES_SUPPRESSED_TOTAL: &str = "shopbook_remote_pushes_suppressed_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on {addr}: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertShop { .. } => "insert_shop",
        Command::UpdateShopHours { .. } => "update_shop_hours",
        Command::InsertClient { .. } => "insert_client",
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::UpdateAppointment { .. } => "update_appointment",
        Command::CancelAppointment { .. } => "cancel_appointment",
        Command::SelectAppointment { .. } => "select_appointment",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectCounts { .. } => "select_counts",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectShops => "select_shops",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
