use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "clubdesk_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "clubdesk_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "clubdesk_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "clubdesk_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "clubdesk_connections_rejected_total";

/// Gauge: number of loaded site engines.
pub const SITES_ACTIVE: &str = "clubdesk_sites_active";

/// Counter: startup/auth failures, device password and staff PIN alike.
pub const AUTH_FAILURES_TOTAL: &str = "clubdesk_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "clubdesk_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "clubdesk_wal_flush_batch_size";

// ── Front desk ──────────────────────────────────────────────────

/// Counter: visits opened. Labels: tier.
pub const CHECKINS_TOTAL: &str = "clubdesk_checkins_total";

/// Counter: visits closed. Labels: tier.
pub const CHECKOUTS_TOTAL: &str = "clubdesk_checkouts_total";

/// Counter: late fees charged, in cents.
pub const LATE_FEES_CENTS_TOTAL: &str = "clubdesk_late_fees_cents_total";

/// Counter: accepted upgrades. Labels: tier (the new one).
pub const UPGRADES_TOTAL: &str = "clubdesk_upgrades_total";

/// Counter: lane holds and waitlist offers released by the reaper.
pub const HOLDS_EXPIRED_TOTAL: &str = "clubdesk_holds_expired_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on :{port}: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertResource { .. } => "insert_resource",
        Command::RetireResource { .. } => "retire_resource",
        Command::ChangeStatus { .. } => "change_status",
        Command::OpenLane { .. } => "open_lane",
        Command::CloseLane { .. } => "close_lane",
        Command::CheckIn { .. } => "check_in",
        Command::Renew { .. } => "renew",
        Command::CheckOut { .. } => "check_out",
        Command::JoinWaitlist { .. } => "join_waitlist",
        Command::LeaveWaitlist { .. } => "leave_waitlist",
        Command::AcceptUpgrade { .. } => "accept_upgrade",
        Command::InsertLineItem { .. } => "insert_line_item",
        Command::InsertStaff { .. } => "insert_staff",
        Command::DeactivateStaff { .. } => "deactivate_staff",
        Command::OpenSession { .. } => "open_session",
        Command::CloseSession { .. } => "close_session",
        Command::ClockIn { .. } => "clock_in",
        Command::ClockOut { .. } => "clock_out",
        Command::ScheduleShift { .. } => "schedule_shift",
        Command::RemoveShift { .. } => "remove_shift",
        Command::SelectInventory { .. } => "select_inventory",
        Command::SelectAvailability => "select_availability",
        Command::SelectVisits { .. } => "select_visits",
        Command::SelectWaitlist => "select_waitlist",
        Command::SelectLineItems { .. } => "select_line_items",
        Command::SelectCheckoutQuote { .. } => "select_checkout_quote",
        Command::SelectLaneSessions => "select_lane_sessions",
        Command::SelectStaff => "select_staff",
        Command::SelectTimeclock { .. } => "select_timeclock",
        Command::SelectSchedule { .. } => "select_schedule",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
