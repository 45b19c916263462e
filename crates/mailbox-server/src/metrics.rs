//! Prometheus metrics for the mailbox servers
//!
//! Privacy-safe metrics: only operation, role and outcome labels, never row
//! indices or payloads.

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

pub const OUTCOME_OK: &str = "ok";
pub const OUTCOME_CLIENT_ERROR: &str = "client_error";
pub const OUTCOME_TRANSPORT_ERROR: &str = "transport_error";

pub const VERDICT_ACCEPTED: &str = "accepted";
pub const VERDICT_REJECTED: &str = "rejected";

pub fn record_operation(op: &str, outcome: &str, duration: Duration) {
    counter!("mailbox_operations_total", "op" => op.to_string(), "outcome" => outcome.to_string()).increment(1);
    histogram!("mailbox_operation_duration_seconds", "op" => op.to_string(), "outcome" => outcome.to_string())
        .record(duration.as_secs_f64());
}

pub fn record_operation_start(op: &str) {
    gauge!("mailbox_operations_in_flight", "op" => op.to_string()).increment(1.0);
}

pub fn record_operation_end(op: &str) {
    gauge!("mailbox_operations_in_flight", "op" => op.to_string()).decrement(1.0);
}

pub fn record_audit(role: &str, verdict: &str) {
    counter!("mailbox_audit_total", "role" => role.to_string(), "verdict" => verdict.to_string()).increment(1);
}

pub fn record_rollback(role: &str) {
    counter!("mailbox_rollbacks_total", "role" => role.to_string()).increment(1);
}

pub fn set_table_rows(rows: usize) {
    gauge!("mailbox_table_rows").set(rows as f64);
}

/// Install the global recorder and serve `/metrics` on `addr`
pub fn init_prometheus_exporter(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()
}
