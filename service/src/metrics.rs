//! Prometheus export of the pipeline counters.
//!
//! Counters are recorded with the `metrics` macros where the work happens;
//! this module only installs the exporter and registers descriptions.

use metrics::describe_counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors from installing the exporter.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// The recorder or its HTTP listener could not be installed
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Install the global Prometheus recorder, scraped over HTTP at `addr`.
///
/// Must run inside a Tokio runtime; the listener is spawned onto it.
///
/// # Errors
///
/// Returns [`MetricsError::Install`] if a recorder is already installed or
/// the listener cannot bind.
pub fn install_exporter(addr: SocketAddr) -> Result<(), MetricsError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| MetricsError::Install(e.to_string()))?;

    describe_metrics();
    tracing::info!(addr = %addr, "Metrics exporter listening");
    Ok(())
}

/// Register descriptions of every pipeline counter.
pub fn describe_metrics() {
    describe_counter!("review_events.published", "Review events acknowledged by the broker");
    describe_counter!("review_events.publish_failed", "Review events the broker did not accept");
    describe_counter!("review_events.applied", "Review events applied to a mentor aggregate");
    describe_counter!("review_events.dropped", "Undecodable review events committed without applying");
    describe_counter!("review_events.dead_lettered", "Review events parked after exhausting retries");
    describe_counter!("mentor_aggregate.deltas", "Rating deltas written to mentor aggregates");
    describe_counter!("dead_letter_queue.added", "Entries written to the dead letter table");
    describe_counter!("dead_letter_queue.resolved", "Dead letter entries marked resolved");
    describe_counter!("dead_letter_queue.discarded", "Dead letter entries discarded");
}
