use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "parkline_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "parkline_query_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: reservation transitions. Labels: op, outcome.
pub const RESERVATION_OPS_TOTAL: &str = "parkline_reservation_ops_total";

/// Counter: rejected bookings. Labels: rule.
pub const CONFLICTS_TOTAL: &str = "parkline_conflicts_total";

/// Counter: walk-in transitions. Labels: op, outcome.
pub const WALK_IN_OPS_TOTAL: &str = "parkline_walk_in_ops_total";

/// Counter: sensor events. Labels: kind, outcome.
pub const SENSOR_EVENTS_TOTAL: &str = "parkline_sensor_events_total";

/// Counter: expiry tasks processed. Labels: outcome.
pub const EXPIRY_FIRED_TOTAL: &str = "parkline_expiry_fired_total";

/// Gauge: pending expiry tasks.
pub const EXPIRY_PENDING: &str = "parkline_expiry_pending";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "parkline_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "parkline_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "parkline_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "parkline_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "parkline_wal_flush_batch_size";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertFacility { .. } => "insert_facility",
        Command::InsertFloor { .. } => "insert_floor",
        Command::InsertSpot { .. } => "insert_spot",
        Command::InsertVehicle { .. } => "insert_vehicle",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::ModifyReservation { .. } => "modify_reservation",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::CompleteReservation { .. } => "complete_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::InsertQuickReservation { .. } => "insert_quick_reservation",
        Command::CompleteQuickReservation { .. } => "complete_quick_reservation",
        Command::CancelQuickReservation { .. } => "cancel_quick_reservation",
        Command::InsertSensorEvent { .. } => "insert_sensor_event",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectQuickReservations { .. } => "select_quick_reservations",
        Command::SelectSpots { .. } => "select_spots",
        Command::SelectOccupancy { .. } => "select_occupancy",
        Command::SelectSensorEvents { .. } => "select_sensor_events",
        Command::SelectConflict { .. } => "select_conflict",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
