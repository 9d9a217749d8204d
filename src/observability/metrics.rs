//! Metrics collection and exposition.
//!
//! # Metrics
//! - `upgrade_reloads_total` (counter): reload attempts by outcome
//! - `upgrade_shutdowns_total` (counter): drains by outcome
//! - `upgrade_drain_seconds` (histogram): time spent draining

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus exporter on `addr`. Must run inside a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

/// Record the outcome of a reload attempt ("spawned", "failed", "not_ready").
pub fn record_reload(outcome: &'static str) {
    metrics::counter!("upgrade_reloads_total", "outcome" => outcome).increment(1);
}

/// Record the outcome of a drain ("completed", "timeout", "failed").
pub fn record_shutdown(outcome: &'static str, elapsed: Duration) {
    metrics::counter!("upgrade_shutdowns_total", "outcome" => outcome).increment(1);
    metrics::histogram!("upgrade_drain_seconds").record(elapsed.as_secs_f64());
}
