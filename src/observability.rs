use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "roomhold_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "roomhold_request_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: reservations created. Labels: tier.
pub const BOOKINGS_CREATED_TOTAL: &str = "roomhold_bookings_created_total";

/// Counter: reservations confirmed. Labels: tier.
pub const BOOKINGS_CONFIRMED_TOTAL: &str = "roomhold_bookings_confirmed_total";

pub const BOOKINGS_CANCELLED_TOTAL: &str = "roomhold_bookings_cancelled_total";

/// Counter: requests rejected for overlap. Labels: source (store, calendar).
pub const BOOKING_CONFLICTS_TOTAL: &str = "roomhold_booking_conflicts_total";

pub const PAYMENTS_DECLINED_TOTAL: &str = "roomhold_payments_declined_total";

/// Counter: calendar side effects that did not happen. Labels: op.
pub const CALENDAR_SYNC_FAILURES_TOTAL: &str = "roomhold_calendar_sync_failures_total";

// ── Collaborators ───────────────────────────────────────────────

/// Histogram: gateway call latency in seconds. Labels: call.
pub const GATEWAY_CALL_DURATION_SECONDS: &str = "roomhold_gateway_call_duration_seconds";

/// Counter: failed gateway calls. Labels: call, kind.
pub const GATEWAY_FAILURES_TOTAL: &str = "roomhold_gateway_failures_total";

/// Counter: availability answers reported unavailable because a busy source failed.
pub const AVAILABILITY_UNVERIFIED_TOTAL: &str = "roomhold_availability_unverified_total";

pub const GRID_BUILD_DURATION_SECONDS: &str = "roomhold_grid_build_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roomhold_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roomhold_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roomhold_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roomhold_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roomhold_wal_flush_batch_size";

/// Gauge: external events held in the cache.
pub const CACHE_EVENTS: &str = "roomhold_cache_events";

// ── Background tasks ────────────────────────────────────────────

/// Counter: clock-driven transitions. Labels: to.
pub const SWEEPER_TRANSITIONS_TOTAL: &str = "roomhold_sweeper_transitions_total";

pub const PENDING_RELEASED_TOTAL: &str = "roomhold_pending_released_total";

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

/// Map a Request variant to a short label for metrics.
pub fn request_label(req: &Request) -> &'static str {
    match req {
        Request::WeeklyGrid { .. } => "weekly_grid",
        Request::MaxDuration { .. } => "max_duration",
        Request::QuoteBooking(_) => "quote_booking",
        Request::CreateBooking(_) => "create_booking",
        Request::BeginPayment { .. } => "begin_payment",
        Request::ConfirmPayment { .. } => "confirm_payment",
        Request::CancelBooking { .. } => "cancel_booking",
        Request::ListBookingsForPayer { .. } => "list_bookings_for_payer",
        Request::GetBooking { .. } => "get_booking",
        Request::CheckIn { .. } => "check_in",
        Request::CheckOut { .. } => "check_out",
        Request::RecordRefund { .. } => "record_refund",
        Request::UpsertExternalEvent(_) => "upsert_external_event",
        Request::RemoveExternalEvent { .. } => "remove_external_event",
        Request::Listen { .. } => "listen",
        Request::Unlisten { .. } => "unlisten",
    }
}
