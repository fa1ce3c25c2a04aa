//! Prometheus metrics for the waiting room.
//!
//! Metric families:
//! - Admission cycles and promotion outcomes
//! - Leader lease acquisition and loss
//! - Reconciliation duties
//! - Request-path operations (enter, position, complete, exit)
//! - Retries of transient store failures
//!
//! # Example
//!
//! ```rust,no_run
//! use waiting_room_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Start metrics server on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Serves `/metrics` on its own listener for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the global recorder and start the HTTP listener.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or the recorder cannot
    /// be installed. A recorder that is already installed (as in tests) is
    /// logged and tolerated.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                self.handle = Some(handle);
                tokio::spawn(async move {
                    if exporter.await.is_err() {
                        tracing::error!("Metrics listener stopped");
                    }
                });
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!(
                        "Metrics recorder already initialized, skipping re-initialization"
                    );
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Admission
    describe_counter!(
        "waiting_room_admission_cycles_total",
        "Admission ticks by outcome (not_leader, completed, lease_lost, failed)"
    );
    describe_counter!(
        "waiting_room_promotions_total",
        "Promote primitive results by outcome (moved, skipped, rejected_full)"
    );
    describe_counter!(
        "waiting_room_grant_write_failures_total",
        "Grants rolled back because the durable write failed"
    );
    describe_histogram!(
        "waiting_room_admission_queue_duration_seconds",
        "Time to run one queue's promotion batch"
    );

    // Leader lease
    describe_counter!(
        "waiting_room_lease_events_total",
        "Leader lease events (acquired, contended, lost, released)"
    );

    // Reconciliation
    describe_counter!(
        "waiting_room_reconcile_runs_total",
        "Reconciliation runs by duty and result"
    );
    describe_counter!(
        "waiting_room_reconcile_actions_total",
        "Entries touched by reconciliation, by duty and action"
    );
    describe_histogram!(
        "waiting_room_reconcile_duration_seconds",
        "Reconciliation run duration by duty"
    );
    describe_counter!(
        "waiting_room_durable_entries_expired_total",
        "Enterable entries moved to expired by the durable expiry sweep"
    );

    // Requests
    describe_counter!(
        "waiting_room_requests_total",
        "Request-path operations by operation and outcome"
    );
    describe_histogram!(
        "waiting_room_request_duration_seconds",
        "Request-path operation latency"
    );

    // Retry
    describe_counter!(
        "waiting_room_retry_attempts_total",
        "Retries scheduled after a transient store failure"
    );
    describe_counter!(
        "waiting_room_retry_outcomes_total",
        "Retried operations by final outcome (recovered, exhausted)"
    );
}

/// Admission metrics recorder.
pub struct AdmissionMetrics;

impl AdmissionMetrics {
    /// Record the end of an admission tick.
    pub fn record_cycle(outcome: &'static str) {
        counter!("waiting_room_admission_cycles_total", "outcome" => outcome).increment(1);
    }

    /// Record promote primitive results.
    pub fn record_promotions(outcome: &'static str, count: u64) {
        if count > 0 {
            counter!("waiting_room_promotions_total", "outcome" => outcome).increment(count);
        }
    }

    /// Record a grant rolled back after a failed durable write.
    pub fn record_grant_write_failure() {
        counter!("waiting_room_grant_write_failures_total").increment(1);
    }

    /// Record how long one queue's batch took.
    pub fn record_queue_duration(duration: Duration) {
        histogram!("waiting_room_admission_queue_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Leader lease metrics recorder.
pub struct LeaseMetrics;

impl LeaseMetrics {
    /// Record a lease event.
    pub fn record(event: &'static str) {
        counter!("waiting_room_lease_events_total", "event" => event).increment(1);
    }
}

/// Reconciliation metrics recorder.
pub struct ReconcileMetrics;

impl ReconcileMetrics {
    /// Record a finished run of a duty.
    pub fn record_run(duty: &'static str, succeeded: bool, duration: Duration) {
        let result = if succeeded { "ok" } else { "error" };
        counter!("waiting_room_reconcile_runs_total", "duty" => duty, "result" => result)
            .increment(1);
        histogram!("waiting_room_reconcile_duration_seconds", "duty" => duty)
            .record(duration.as_secs_f64());
    }

    /// Record entries touched by a duty.
    pub fn record_actions(duty: &'static str, action: &'static str, count: u64) {
        if count > 0 {
            counter!("waiting_room_reconcile_actions_total", "duty" => duty, "action" => action)
                .increment(count);
        }
    }
}

/// Request-path metrics recorder.
pub struct RequestMetrics;

impl RequestMetrics {
    /// Record one request-path operation.
    pub fn record(operation: &'static str, outcome: &'static str, duration: Duration) {
        counter!("waiting_room_requests_total", "operation" => operation, "outcome" => outcome)
            .increment(1);
        histogram!("waiting_room_request_duration_seconds", "operation" => operation)
            .record(duration.as_secs_f64());
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a scheduled retry.
    pub fn record_attempt(operation: &'static str) {
        counter!("waiting_room_retry_attempts_total", "operation" => operation).increment(1);
    }

    /// Record how a retried operation ended.
    pub fn record_outcome(operation: &'static str, outcome: &'static str) {
        counter!(
            "waiting_room_retry_outcomes_total",
            "operation" => operation,
            "outcome" => outcome,
        )
        .increment(1);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[tokio::test]
    async fn test_metrics_server_records_waiting_room_metrics() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        AdmissionMetrics::record_cycle("completed");
        AdmissionMetrics::record_promotions("moved", 3);
        ReconcileMetrics::record_run("expiry_sweep", true, Duration::from_millis(4));
        RequestMetrics::record("enter", "waiting", Duration::from_millis(2));

        // Another test may have installed the recorder first.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("waiting_room_admission_cycles_total"));
            assert!(rendered.contains("waiting_room_promotions_total"));
            assert!(rendered.contains("waiting_room_reconcile_runs_total"));
            assert!(rendered.contains("waiting_room_requests_total"));
        }
    }
}
