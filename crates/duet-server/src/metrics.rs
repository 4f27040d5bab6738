//! Metrics collection and export for Duet.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "duet_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "duet_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "duet_connections_rejected_total";
    pub const FRAMES_TOTAL: &str = "duet_frames_total";
    pub const FRAMES_BYTES: &str = "duet_frames_bytes";
    pub const MESSAGES_ROUTED: &str = "duet_messages_routed_total";
    pub const BACKLOG_FLUSHED: &str = "duet_backlog_flushed_total";
    pub const DELETIONS_TOTAL: &str = "duet_deletions_total";
    pub const SESSIONS_SKIPPED: &str = "duet_sessions_skipped_total";
    pub const ONLINE_USERS: &str = "duet_online_users";
    pub const LATENCY_SECONDS: &str = "duet_frame_latency_seconds";
    pub const ERRORS_TOTAL: &str = "duet_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Upgrades refused because the connection limit was reached"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames by direction");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of frames by direction");
    metrics::describe_counter!(
        names::MESSAGES_ROUTED,
        "Chat messages routed, by path (live or stored)"
    );
    metrics::describe_counter!(
        names::BACKLOG_FLUSHED,
        "Stored messages flushed to a joining session"
    );
    metrics::describe_counter!(names::DELETIONS_TOTAL, "Deletion notices broadcast");
    metrics::describe_counter!(
        names::SESSIONS_SKIPPED,
        "Deliveries skipped because the session queue was full or closed"
    );
    metrics::describe_gauge!(names::ONLINE_USERS, "Users with at least one joined session");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound frame handling latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors by kind");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record an upgrade refused at the connection limit.
pub fn record_rejected_connection() {
    counter!(names::CONNECTIONS_REJECTED).increment(1);
}

/// Record a frame.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a routed chat message.
pub fn record_routed(path: &'static str) {
    counter!(names::MESSAGES_ROUTED, "path" => path).increment(1);
}

/// Record backlog messages handed to a joining session.
pub fn record_backlog(count: usize) {
    if count > 0 {
        counter!(names::BACKLOG_FLUSHED).increment(count as u64);
    }
}

/// Record a deletion notice.
pub fn record_deletion() {
    counter!(names::DELETIONS_TOTAL).increment(1);
}

/// Record sessions skipped during a broadcast.
pub fn record_skipped(count: usize) {
    if count > 0 {
        counter!(names::SESSIONS_SKIPPED).increment(count as u64);
    }
}

/// Update the online user count.
pub fn set_online_users(count: usize) {
    gauge!(names::ONLINE_USERS).set(count as f64);
}

/// Record frame handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(kind: &'static str) {
    counter!(names::ERRORS_TOTAL, "kind" => kind).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_metrics_are_exported() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            let guard = ConnectionMetricsGuard::new();
            record_frame(42, "inbound");
            record_routed("live");
            record_routed("stored");
            record_backlog(3);
            record_skipped(0);
            drop(guard);
        });

        let rendered = handle.render();
        assert!(rendered.contains("duet_connections_total 1"));
        assert!(rendered.contains(r#"duet_messages_routed_total{path="live"} 1"#));
        assert!(rendered.contains(r#"duet_messages_routed_total{path="stored"} 1"#));
        assert!(rendered.contains("duet_backlog_flushed_total 3"));
        assert!(!rendered.contains("duet_sessions_skipped_total"));
    }
}
