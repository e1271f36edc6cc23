use std::net::SocketAddr;

use crate::protocol::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "parkd_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "parkd_request_duration_seconds";

// ── Allocation ──────────────────────────────────────────────────

/// Counter: assign attempts. Labels: outcome.
pub const ASSIGNMENTS_TOTAL: &str = "parkd_assignments_total";

/// Histogram: slots examined per assign call.
pub const ASSIGN_CANDIDATES_SCANNED: &str = "parkd_assign_candidates_scanned";

/// Counter: reservations/bookings expired by the sweeper.
pub const SWEEPER_EXPIRED_TOTAL: &str = "parkd_sweeper_expired_total";

/// Counter: overdue transactions flagged for review.
pub const SWEEPER_FLAGGED_TOTAL: &str = "parkd_sweeper_flagged_total";

/// Histogram: duration of one sweep in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "parkd_sweep_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "parkd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "parkd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "parkd_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "parkd_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "parkd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "parkd_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a request, used on every request metric.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::Use { .. } => "use",
        Request::RegisterFacility { .. } => "register_facility",
        Request::SetFacilityOpen { .. } => "set_facility_open",
        Request::RegisterFloor { .. } => "register_floor",
        Request::SetFloorStatus { .. } => "set_floor_status",
        Request::RegisterVehicle { .. } => "register_vehicle",
        Request::SetTariff { .. } => "set_tariff",
        Request::ClaimSlot { .. } => "claim_slot",
        Request::ReleaseSlot { .. } => "release_slot",
        Request::Assign { .. } => "assign",
        Request::Reserve { .. } => "reserve",
        Request::FindConflict { .. } => "find_conflict",
        Request::ExpireReservation { .. } => "expire_reservation",
        Request::CancelReservation { .. } => "cancel_reservation",
        Request::ConfirmEntry { .. } => "confirm_entry",
        Request::ConfirmExit { .. } => "confirm_exit",
        Request::Cancel { .. } => "cancel",
        Request::SlotStatus { .. } => "slot_status",
        Request::Occupancy { .. } => "occupancy",
        Request::GetBooking { .. } => "get_booking",
        Request::GetReservation { .. } => "get_reservation",
        Request::GetTransaction { .. } => "get_transaction",
        Request::OpenTransactions { .. } => "open_transactions",
        Request::ReservationsForSlot { .. } => "reservations_for_slot",
        Request::FlaggedTransactions => "flagged_transactions",
        Request::Listen { .. } => "listen",
        Request::Unlisten { .. } => "unlisten",
    }
}
