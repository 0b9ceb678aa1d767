//! Prometheus metrics for the synchronization pipeline.
//!
//! Recording is always on; without an installed recorder the calls are no-ops.
//! [`MetricsServer`] installs a Prometheus recorder and serves `/metrics` over HTTP.
//!
//! | Metric                                  | Labels                   |
//! |-----------------------------------------|--------------------------|
//! | `user_sync_messages_total`              | `queue`, `outcome`       |
//! | `user_sync_apply_duration_seconds`      | `action`                 |
//! | `user_sync_published_total`             | `routing_key`, `outcome` |
//! | `user_sync_broker_connect_attempts_total` | `outcome`              |
//!
//! # Example
//!
//! ```rust,no_run
//! use user_sync_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

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
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the recorder and spawn the HTTP listener on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or another recorder
    /// is already installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        metrics::set_global_recorder(recorder).map_err(|e| MetricsError::Install(e.to_string()))?;

        let addr = self.addr;
        tokio::spawn(async move {
            if let Err(e) = exporter.await {
                tracing::error!(addr = %addr, error = ?e, "Metrics exporter stopped");
            }
        });

        tracing::info!(addr = %self.addr, "Metrics server started - available at http://{}/metrics", self.addr);
        self.handle = Some(handle);
        Ok(())
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(
        "user_sync_messages_total",
        "Deliveries settled by consumers, by queue and outcome"
    );
    describe_histogram!(
        "user_sync_apply_duration_seconds",
        "Time taken to apply an event to the user store"
    );
    describe_counter!(
        "user_sync_published_total",
        "Publish attempts per destination, by outcome"
    );
    describe_counter!(
        "user_sync_broker_connect_attempts_total",
        "Broker connection attempts, by outcome"
    );
}

/// Consumer metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record a settled delivery.
    pub fn record_message(queue: &str, outcome: &'static str) {
        counter!(
            "user_sync_messages_total",
            "queue" => queue.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }

    /// Record how long an apply took.
    pub fn record_apply(action: &'static str, duration: Duration) {
        histogram!("user_sync_apply_duration_seconds", "action" => action)
            .record(duration.as_secs_f64());
    }
}

/// Publisher metrics recorder.
pub struct PublisherMetrics;

impl PublisherMetrics {
    /// Record one destination's publish result.
    pub fn record_publish(routing_key: &str, delivered: bool) {
        let outcome = if delivered { "delivered" } else { "failed" };
        counter!(
            "user_sync_published_total",
            "routing_key" => routing_key.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }
}

/// Connection metrics recorder.
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    /// Record a connection attempt.
    pub fn record_attempt(connected: bool) {
        let outcome = if connected { "connected" } else { "failed" };
        counter!("user_sync_broker_connect_attempts_total", "outcome" => outcome).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_server_not_started_renders_nothing() {
        let server = MetricsServer::new(SocketAddr::from(([127, 0, 0, 1], 0)));
        assert!(server.render().is_none());
    }

    #[test]
    fn test_recorders_emit_labelled_series() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            ConsumerMetrics::record_message("crm_user_create", "applied");
            ConsumerMetrics::record_message("crm_user_create", "invalid_event");
            PublisherMetrics::record_publish("kassa.user.create", false);
            ConnectionMetrics::record_attempt(true);
        });

        let rendered = handle.render();
        assert!(rendered.contains("user_sync_messages_total"));
        assert!(rendered.contains("queue=\"crm_user_create\""));
        assert!(rendered.contains("outcome=\"rejected\""));
        assert!(rendered.contains("routing_key=\"kassa.user.create\""));
        assert!(rendered.contains("user_sync_broker_connect_attempts_total"));
    }
}
