//! Prometheus metrics for observability and monitoring.
//!
//! Covers the broker-facing parts of the service:
//! - Deliveries received and settled per queue
//! - Events published and publish failures per exchange
//! - Worker restarts
//! - Broker connections opened
//!
//! The recorder is rendered by the HTTP health server on `/metrics`.
//!
//! # Example
//!
//! ```rust,no_run
//! use analysis_orchestrator_runtime::metrics::{self, ConsumerMetrics};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let handle = metrics::install_recorder()?;
//! ConsumerMetrics::record_received("orchestrator.image-uploaded");
//! println!("{}", handle.render());
//! # Ok(())
//! # }
//! ```

use analysis_orchestrator_core::HandlerOutcome;
use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use thiserror::Error;

/// Deliveries taken off a queue.
pub const MESSAGES_RECEIVED: &str = "orchestrator_messages_received_total";
/// Deliveries positively acknowledged.
pub const MESSAGES_ACKED: &str = "orchestrator_messages_acked_total";
/// Deliveries rejected, with or without requeue.
pub const MESSAGES_REJECTED: &str = "orchestrator_messages_rejected_total";
/// Events and commands published.
pub const EVENTS_PUBLISHED: &str = "orchestrator_events_published_total";
/// Failed publish attempts.
pub const PUBLISH_FAILURES: &str = "orchestrator_publish_failures_total";
/// Worker restarts after a failed attempt.
pub const WORKER_RESTARTS: &str = "orchestrator_worker_restarts_total";
/// Broker connections opened.
pub const CONNECTIONS_OPENED: &str = "orchestrator_connections_opened_total";

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Register descriptions and install the global Prometheus recorder.
///
/// # Errors
///
/// Returns [`MetricsError::Install`] if a global recorder is already set.
pub fn install_recorder() -> Result<PrometheusHandle, MetricsError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| MetricsError::Install(e.to_string()))?;
    register_metrics();
    tracing::info!("Metrics recorder installed");
    Ok(handle)
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(MESSAGES_RECEIVED, "Total number of deliveries received per queue");
    describe_counter!(MESSAGES_ACKED, "Total number of deliveries acknowledged");
    describe_counter!(
        MESSAGES_REJECTED,
        "Total number of deliveries rejected (requeue label tells whether they were put back)"
    );
    describe_counter!(EVENTS_PUBLISHED, "Total number of messages published per exchange");
    describe_counter!(PUBLISH_FAILURES, "Total number of failed publish attempts");
    describe_counter!(WORKER_RESTARTS, "Total number of worker restarts");
    describe_counter!(CONNECTIONS_OPENED, "Total number of broker connections opened");
}

/// Consumer-side metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record a delivery taken off `queue`.
    pub fn record_received(queue: &str) {
        counter!(MESSAGES_RECEIVED, "queue" => queue.to_string()).increment(1);
    }

    /// Record how a delivery from `queue` was settled.
    pub fn record_settled(queue: &str, outcome: HandlerOutcome) {
        match outcome {
            HandlerOutcome::Ack => {
                counter!(MESSAGES_ACKED, "queue" => queue.to_string()).increment(1);
            }
            HandlerOutcome::RejectDrop => {
                counter!(MESSAGES_REJECTED, "queue" => queue.to_string(), "requeue" => "false")
                    .increment(1);
            }
            HandlerOutcome::RejectRequeue => {
                counter!(MESSAGES_REJECTED, "queue" => queue.to_string(), "requeue" => "true")
                    .increment(1);
            }
        }
    }
}

/// Publisher-side metrics recorder.
pub struct PublisherMetrics;

impl PublisherMetrics {
    /// Record a message published to `exchange`.
    pub fn record_published(exchange: &str) {
        counter!(EVENTS_PUBLISHED, "exchange" => exchange.to_string()).increment(1);
    }

    /// Record a failed publish to `exchange`.
    pub fn record_failure(exchange: &str, kind: &'static str) {
        counter!(PUBLISH_FAILURES, "exchange" => exchange.to_string(), "kind" => kind)
            .increment(1);
    }
}

/// Worker supervision metrics recorder.
pub struct SupervisorMetrics;

impl SupervisorMetrics {
    /// Record a restart of `worker`.
    pub fn record_restart(worker: &str) {
        counter!(WORKER_RESTARTS, "worker" => worker.to_string()).increment(1);
    }
}

/// Connection metrics recorder.
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    /// Record a newly opened broker connection.
    pub fn record_opened() {
        counter!(CONNECTIONS_OPENED).increment(1);
    }
}
