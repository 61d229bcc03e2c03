use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: locks acquired.
pub const LOCKS_ACQUIRED_TOTAL: &str = "slotlock_locks_acquired_total";

/// Counter: acquisitions rejected because the slot was held or booked.
pub const LOCK_CONFLICTS_TOTAL: &str = "slotlock_lock_conflicts_total";

/// Counter: locks released (explicitly or by the confirm-window timer).
pub const LOCKS_RELEASED_TOTAL: &str = "slotlock_locks_released_total";

/// Counter: bookings confirmed.
pub const BOOKINGS_CONFIRMED_TOTAL: &str = "slotlock_bookings_confirmed_total";

/// Counter: bookings cancelled.
pub const BOOKINGS_CANCELLED_TOTAL: &str = "slotlock_bookings_cancelled_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active websocket connections.
pub const WS_CONNECTIONS_ACTIVE: &str = "slotlock_ws_connections_active";

/// Counter: total websocket connections accepted.
pub const WS_CONNECTIONS_TOTAL: &str = "slotlock_ws_connections_total";

/// Counter: events fanned out to rooms.
pub const ROOM_EVENTS_PUBLISHED_TOTAL: &str = "slotlock_room_events_published_total";

/// Counter: ledger entries appended.
pub const LEDGER_APPENDS_TOTAL: &str = "slotlock_ledger_appends_total";

/// Histogram: ledger append (serialize + fsync) duration in seconds.
pub const LEDGER_APPEND_DURATION_SECONDS: &str = "slotlock_ledger_append_duration_seconds";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
