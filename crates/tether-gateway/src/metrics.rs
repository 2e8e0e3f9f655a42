//! Prometheus metrics for the gateway.
//!
//! Exported at `/metrics` in Prometheus text format.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `tether_webhook_requests_total` | Counter | `source`, `outcome` |
//! | `tether_admission_denials_total` | Counter | `kind`, `reason` |
//! | `tether_api_requests_total` | Counter | `operation`, `status` |
//! | `tether_sessions_created_total` | Counter | `source` |
//! | `tether_admission_latency_seconds` | Histogram | — |
//!
//! # Thread Safety
//!
//! All metrics use interior mutability and the struct is `Clone`, `Send`,
//! and `Sync`.

use std::sync::Arc;

use prometheus::{
    CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use thiserror::Error;

/// Label values longer than this are truncated to bound cardinality abuse.
const MAX_LABEL_VALUE_LEN: usize = 64;

/// Admission latency buckets in seconds; admission is specified to stay
/// in the tens of milliseconds.
const ADMISSION_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1];

/// Errors from metrics registration or encoding.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Gateway metrics handle.
#[derive(Clone)]
pub struct GatewayMetrics {
    webhook_requests_total: CounterVec,
    admission_denials_total: CounterVec,
    api_requests_total: CounterVec,
    sessions_created_total: CounterVec,
    admission_latency: Histogram,
}

impl GatewayMetrics {
    /// Creates and registers the metric families.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register.
    pub fn register(registry: &Registry) -> Result<Self, MetricsError> {
        let webhook_requests_total = CounterVec::new(
            Opts::new(
                "tether_webhook_requests_total",
                "Inbound webhook requests by source and outcome",
            ),
            &["source", "outcome"],
        )?;
        let admission_denials_total = CounterVec::new(
            Opts::new(
                "tether_admission_denials_total",
                "Admission rejections by error kind and reason",
            ),
            &["kind", "reason"],
        )?;
        let api_requests_total = CounterVec::new(
            Opts::new(
                "tether_api_requests_total",
                "Read API requests by operation and HTTP status",
            ),
            &["operation", "status"],
        )?;
        let sessions_created_total = CounterVec::new(
            Opts::new(
                "tether_sessions_created_total",
                "Sessions admitted, by trigger source",
            ),
            &["source"],
        )?;
        let admission_latency = Histogram::with_opts(
            HistogramOpts::new(
                "tether_admission_latency_seconds",
                "Synchronous admission validation latency",
            )
            .buckets(ADMISSION_BUCKETS.to_vec()),
        )?;

        registry.register(Box::new(webhook_requests_total.clone()))?;
        registry.register(Box::new(admission_denials_total.clone()))?;
        registry.register(Box::new(api_requests_total.clone()))?;
        registry.register(Box::new(sessions_created_total.clone()))?;
        registry.register(Box::new(admission_latency.clone()))?;

        Ok(Self {
            webhook_requests_total,
            admission_denials_total,
            api_requests_total,
            sessions_created_total,
            admission_latency,
        })
    }

    /// Records one webhook request.
    pub fn webhook_request(&self, source: &str, outcome: &str) {
        self.webhook_requests_total
            .with_label_values(&[clamp(source), clamp(outcome)])
            .inc();
    }

    /// Records one admission denial.
    pub fn admission_denied(&self, kind: &str, reason: &str) {
        self.admission_denials_total
            .with_label_values(&[clamp(kind), clamp(reason)])
            .inc();
    }

    /// Records one read-API request.
    pub fn api_request(&self, operation: &str, status: u16) {
        self.api_requests_total
            .with_label_values(&[clamp(operation), &status.to_string()])
            .inc();
    }

    /// Records one admitted session.
    pub fn session_created(&self, source: &str) {
        self.sessions_created_total
            .with_label_values(&[clamp(source)])
            .inc();
    }

    /// Records admission validation latency in seconds.
    pub fn observe_admission_latency(&self, seconds: f64) {
        self.admission_latency.observe(seconds);
    }
}

fn clamp(value: &str) -> &str {
    match value.char_indices().nth(MAX_LABEL_VALUE_LEN) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

/// Registry plus metrics, shared across the gateway.
pub struct MetricsRegistry {
    registry: Registry,
    metrics: GatewayMetrics,
}

/// Shared handle.
pub type SharedMetrics = Arc<MetricsRegistry>;

impl MetricsRegistry {
    /// Creates a registry with all gateway metrics registered.
    ///
    /// # Errors
    ///
    /// Returns an error if registration fails (duplicate names).
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let metrics = GatewayMetrics::register(&registry)?;
        Ok(Self { registry, metrics })
    }

    /// The metrics handle.
    #[must_use]
    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_encode() {
        let registry = MetricsRegistry::new().unwrap();
        registry.metrics().webhook_request("github", "accepted");
        registry.metrics().admission_denied("PolicyViolation", "ModelBlocked");
        registry.metrics().api_request("sessions.list", 200);
        registry.metrics().session_created("github");
        registry.metrics().observe_admission_latency(0.004);

        let text = registry.encode_text().unwrap();
        assert!(text.contains("tether_webhook_requests_total"));
        assert!(text.contains("tether_admission_denials_total"));
        assert!(text.contains("tether_api_requests_total"));
        assert!(text.contains("tether_sessions_created_total"));
        assert!(text.contains("tether_admission_latency_seconds"));
    }

    #[test]
    fn long_label_values_are_clamped() {
        let registry = MetricsRegistry::new().unwrap();
        let long = "x".repeat(500);
        registry.metrics().webhook_request(&long, "accepted");
        let text = registry.encode_text().unwrap();
        assert!(text.contains(&"x".repeat(MAX_LABEL_VALUE_LEN)));
        assert!(!text.contains(&"x".repeat(MAX_LABEL_VALUE_LEN + 1)));
    }
}
